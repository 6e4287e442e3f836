//! denops-worker-api: Shared types between a plugin host and its workers
//!
//! This crate defines the protocol spoken over a worker's message channel.
//! Communication uses MessagePack serialization.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod message;

pub use message::{Message, MessageError};

/// How long a worker waits for the response to an outgoing RPC call
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Notification a worker sends to ask the host to respawn it
pub const RELOAD_METHOD: &str = "reload";

/// Host method used to run editor operations (`cmd`, `call`, ...)
pub const INVOKE_METHOD: &str = "invoke";

/// Host method used to reach another plugin's dispatcher
pub const DISPATCH_METHOD: &str = "dispatch";

/// Default prefix of lifecycle autocmd names
pub const DEFAULT_EVENT_NAMESPACE: &str = "Denops";

/// Error name the host uses for an interrupted call
pub const INTERRUPTED: &str = "Interrupted";

/// Startup message, the first and only handshake frame of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInitMessage {
    /// Plugin name
    pub name: String,

    /// Location of the plugin module
    #[serde(rename = "scriptUrl")]
    pub script_url: String,

    /// Environment of the running editor
    pub meta: Meta,
}

/// Environment metadata of the host editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub mode: Mode,
    pub host: Host,
    pub version: String,
    pub platform: Platform,
}

/// Execution mode of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Release,
    Debug,
    Test,
}

/// Editor flavor the host is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Host {
    #[serde(rename = "vim-editor", alias = "vim")]
    Vim,
    #[serde(rename = "neovim-editor", alias = "nvim")]
    Nvim,
}

/// Operating system the editor runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Mac,
    Linux,
}

/// Phase of a plugin load announced to the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Module is loaded, entry function about to run
    Pre,
    /// Entry function returned normally
    Post,
    /// Module load or entry function failed
    Fail,
}

impl LifecycleEvent {
    fn suffix(self) -> &'static str {
        match self {
            Self::Pre => "Pre",
            Self::Post => "Post",
            Self::Fail => "Fail",
        }
    }

    /// User autocmd name, e.g. `DenopsPluginPre:foo`
    pub fn autocmd_name(self, namespace: &str, plugin: &str) -> String {
        format!("{}Plugin{}:{}", namespace, self.suffix(), plugin)
    }

    /// Editor command that fires the autocmd
    pub fn command(self, namespace: &str, plugin: &str) -> String {
        format!(
            "doautocmd <nomodeline> User {}",
            self.autocmd_name(namespace, plugin)
        )
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl WorkerInitMessage {
    /// Decode a handshake frame
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Encode as a handshake frame (map encoded, field names on the wire)
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> Vec<u8> {
        rmp_serde::to_vec_named(&value).unwrap()
    }

    #[test]
    fn test_decode_init_message() {
        let bytes = frame(json!({
            "name": "foo",
            "scriptUrl": "file:///p.wasm",
            "meta": {
                "mode": "test",
                "host": "vim-editor",
                "version": "1.0",
                "platform": "linux",
            },
        }));

        let init = WorkerInitMessage::decode(&bytes).unwrap();
        assert_eq!(init.name, "foo");
        assert_eq!(init.script_url, "file:///p.wasm");
        assert_eq!(init.meta.mode, Mode::Test);
        assert_eq!(init.meta.host, Host::Vim);
        assert_eq!(init.meta.platform, Platform::Linux);
    }

    #[test]
    fn test_host_accepts_short_names() {
        let bytes = frame(json!({
            "name": "foo",
            "scriptUrl": "file:///p.wasm",
            "meta": {"mode": "debug", "host": "nvim", "version": "0.9", "platform": "mac"},
        }));

        let init = WorkerInitMessage::decode(&bytes).unwrap();
        assert_eq!(init.meta.host, Host::Nvim);
    }

    #[test]
    fn test_reject_unknown_platform() {
        let bytes = frame(json!({
            "name": "foo",
            "scriptUrl": "file:///p.wasm",
            "meta": {"mode": "test", "host": "vim-editor", "version": "1.0", "platform": "beos"},
        }));

        assert!(WorkerInitMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_lifecycle_command() {
        assert_eq!(
            LifecycleEvent::Pre.command(DEFAULT_EVENT_NAMESPACE, "foo"),
            "doautocmd <nomodeline> User DenopsPluginPre:foo"
        );
        assert_eq!(
            LifecycleEvent::Fail.autocmd_name("Denops", "bar"),
            "DenopsPluginFail:bar"
        );
    }
}
