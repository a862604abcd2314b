//! Control-plane client for the dataplane agent.
//!
//! Each call opens a connection to the agent, writes one JSON request line and
//! reads one JSON reply line:
//!
//! ```text
//! -> {"op":"put","key":"config/xconnect/abc","value":{...}}
//! <- {"status":"ok"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::BufReader;
use tracing::debug;

use forwarder_config::SocketEndpoint;

use crate::transport::{connect, read_frame, write_frame};

use super::{AgentError, DATAPLANE_TARGET};

/// Handle for pushing configuration into the dataplane agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConnection {
    endpoint: SocketEndpoint,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AgentRequest<'a> {
    Ping,
    Put { key: &'a str, value: &'a Value },
    Delete { key: &'a str },
}

impl AgentRequest<'_> {
    const fn operation(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AgentReply {
    Ok,
    Error { message: String },
}

impl AgentConnection {
    /// Connection to the agent serving `endpoint`.
    #[must_use]
    pub fn new(endpoint: SocketEndpoint) -> Self {
        Self { endpoint }
    }

    /// Control endpoint of the agent.
    #[must_use]
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Checks that the agent is answering.
    pub async fn ping(&self) -> Result<(), AgentError> {
        self.call(&AgentRequest::Ping).await
    }

    /// Stores `value` under `key` in the agent's configuration.
    pub async fn put(&self, key: &str, value: &Value) -> Result<(), AgentError> {
        self.call(&AgentRequest::Put { key, value }).await
    }

    /// Removes `key` from the agent's configuration.
    pub async fn delete(&self, key: &str) -> Result<(), AgentError> {
        self.call(&AgentRequest::Delete { key }).await
    }

    async fn call(&self, request: &AgentRequest<'_>) -> Result<(), AgentError> {
        let stream = connect(&self.endpoint)
            .await
            .map_err(|source| AgentError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        let mut stream = BufReader::new(stream);
        write_frame(stream.get_mut(), request)
            .await
            .map_err(|source| AgentError::Io { source })?;
        let frame = read_frame(&mut stream)
            .await
            .map_err(|source| AgentError::Io { source })?
            .ok_or(AgentError::NoReply)?;
        let reply: AgentReply =
            serde_json::from_slice(&frame).map_err(|source| AgentError::Protocol { source })?;
        debug!(target: DATAPLANE_TARGET, op = request.operation(), "agent call completed");
        match reply {
            AgentReply::Ok => Ok(()),
            AgentReply::Error { message } => Err(AgentError::Rejected {
                operation: request.operation(),
                message,
            }),
        }
    }
}
