//! Docker Engine implementations of the runtime seams, built on `bollard`.

use std::io;

use async_trait::async_trait;
use bollard::{
    container::{InspectContainerOptions, LogOutput, LogsOptions},
    errors::Error as DockerError,
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    Docker,
};
use futures_util::StreamExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::{
    config::DockerSettings,
    protocol::TerminalSize,
    provider::{ExecHandle, LogSource, LogStream, ProviderError, ShellAttachment, ShellProvider},
};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    settings: DockerSettings,
}

impl DockerRuntime {
    pub fn connect(settings: DockerSettings) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
        Ok(Self { docker, settings })
    }

    async fn ensure_exists(&self, container_id: &str) -> Result<(), ProviderError> {
        self.docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map(|_| ())
            .map_err(|err| provider_error(container_id, err))
    }
}

fn provider_error(container_id: &str, err: DockerError) -> ProviderError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => ProviderError::NotFound(container_id.to_string()),
        other => ProviderError::Unavailable(other.to_string()),
    }
}

fn output_bytes(result: Result<LogOutput, DockerError>) -> io::Result<bytes::Bytes> {
    result.map(LogOutput::into_bytes).map_err(io::Error::other)
}

#[async_trait]
impl LogSource for DockerRuntime {
    async fn open(&self, container_id: &str) -> Result<LogStream, ProviderError> {
        self.ensure_exists(container_id).await?;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: self.settings.log_timestamps,
            tail: self.settings.log_tail.clone(),
            ..Default::default()
        };
        debug!(container_id, tail = %self.settings.log_tail, "opening docker log stream");
        let stream = self.docker.logs(container_id, Some(options)).map(output_bytes);
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ShellProvider for DockerRuntime {
    async fn create(&self, container_id: &str) -> Result<ExecHandle, ProviderError> {
        self.ensure_exists(container_id).await?;

        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            cmd: Some(vec![self.settings.exec_shell.clone()]),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|err| provider_error(container_id, err))?;
        debug!(container_id, exec_id = %created.id, shell = %self.settings.exec_shell, "created exec");
        Ok(ExecHandle {
            id: created.id,
            container_id: container_id.to_string(),
        })
    }

    async fn attach(&self, handle: &ExecHandle) -> Result<ShellAttachment, ProviderError> {
        let options = StartExecOptions {
            detach: false,
            tty: true,
            output_capacity: None,
        };
        let started = self
            .docker
            .start_exec(&handle.id, Some(options))
            .await
            .map_err(|err| provider_error(&handle.container_id, err))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let reader = StreamReader::new(output.map(output_bytes));
                Ok(ShellAttachment {
                    input,
                    output: Box::pin(reader),
                })
            }
            StartExecResults::Detached => Err(ProviderError::Unavailable(format!(
                "exec {} started detached",
                handle.id
            ))),
        }
    }

    async fn resize(&self, handle: &ExecHandle, size: TerminalSize) -> Result<(), ProviderError> {
        self.docker
            .resize_exec(
                &handle.id,
                ResizeExecOptions {
                    width: size.cols,
                    height: size.rows,
                },
            )
            .await
            .map_err(|err| provider_error(&handle.container_id, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_container_maps_to_not_found() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web".into(),
        };
        assert!(matches!(
            provider_error("web", err),
            ProviderError::NotFound(id) if id == "web"
        ));
    }

    #[test]
    fn other_failures_map_to_unavailable() {
        let err = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "daemon exploded".into(),
        };
        match provider_error("web", err) {
            ProviderError::Unavailable(message) => assert!(message.contains("daemon exploded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn log_output_bytes_are_unwrapped() {
        let chunk = output_bytes(Ok(LogOutput::StdErr {
            message: bytes::Bytes::from_static(b"oops\n"),
        }))
        .expect("bytes");
        assert_eq!(&chunk[..], b"oops\n");
    }
}
