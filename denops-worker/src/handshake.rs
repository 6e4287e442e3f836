//! Startup handshake
//!
//! The host posts exactly one [`WorkerInitMessage`] before anything else.
//! Only the first frame is read; nothing runs until it decodes.

use crate::channel::WorkerReader;
use denops_worker_api::WorkerInitMessage;
use thiserror::Error;

/// Startup failures, reported before any session exists
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Worker channel closed before the init message arrived")]
    ChannelClosed,

    #[error("Invalid init message: {0}")]
    Malformed(#[source] rmp_serde::decode::Error),
}

/// Wait for the init message and validate its shape
pub async fn receive(reader: &mut WorkerReader) -> Result<WorkerInitMessage, StartupError> {
    let frame = reader
        .read_frame()
        .await
        .ok_or(StartupError::ChannelClosed)?;
    let init = WorkerInitMessage::decode(&frame).map_err(StartupError::Malformed)?;

    tracing::debug!(plugin = %init.name, script = %init.script_url, "Init message received");
    Ok(init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::worker_channel;
    use serde_json::{json, Value};

    async fn receive_value(value: Value) -> Result<WorkerInitMessage, StartupError> {
        let (port, endpoint) = worker_channel(2);
        let (mut reader, _writer) = endpoint.split();
        port.post_frame(rmp_serde::to_vec_named(&value).unwrap())
            .await
            .unwrap();
        receive(&mut reader).await
    }

    fn valid() -> Value {
        json!({
            "name": "foo",
            "scriptUrl": "file:///p.wasm",
            "meta": {"mode": "test", "host": "vim-editor", "version": "1.0", "platform": "linux"},
        })
    }

    #[tokio::test]
    async fn test_receive_valid() {
        let init = receive_value(valid()).await.unwrap();
        assert_eq!(init.name, "foo");
    }

    #[tokio::test]
    async fn test_missing_name() {
        let mut value = valid();
        value.as_object_mut().unwrap().remove("name");
        assert!(matches!(
            receive_value(value).await,
            Err(StartupError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_script_url() {
        let mut value = valid();
        value.as_object_mut().unwrap().remove("scriptUrl");
        assert!(matches!(
            receive_value(value).await,
            Err(StartupError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_name_must_be_string() {
        let mut value = valid();
        value["name"] = json!(42);
        assert!(receive_value(value).await.is_err());
    }

    #[tokio::test]
    async fn test_meta_enumerations() {
        for (field, bad) in [
            ("mode", json!("profile")),
            ("host", json!("emacs")),
            ("platform", json!("solaris")),
            ("version", json!(1)),
        ] {
            let mut value = valid();
            value["meta"][field] = bad;
            assert!(
                receive_value(value).await.is_err(),
                "meta.{} should be rejected",
                field
            );
        }
    }

    #[tokio::test]
    async fn test_not_an_object() {
        assert!(receive_value(json!("hello")).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let (port, endpoint) = worker_channel(2);
        let (mut reader, _writer) = endpoint.split();
        drop(port);
        assert!(matches!(
            receive(&mut reader).await,
            Err(StartupError::ChannelClosed)
        ));
    }
}
