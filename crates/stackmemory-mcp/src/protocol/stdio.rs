//! stdio Transport
//!
//! Line-delimited JSON-RPC over stdin/stdout. Logging goes to stderr;
//! stdout carries nothing but responses.

use std::io::{self, BufRead, BufReader, Write};

use tracing::{debug, error, warn};

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::server::McpServer;

/// Last-resort response when even serialization fails; keeps the client
/// from hanging on a dead line.
const FALLBACK_ERROR: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;

/// stdio transport for the MCP server
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    fn write_response(stdout: &mut impl Write, response: &JsonRpcResponse) -> io::Result<()> {
        match serde_json::to_string(response) {
            Ok(json) => {
                debug!("sending {} bytes", json.len());
                writeln!(stdout, "{}", json)?;
            }
            Err(e) => {
                error!("failed to serialize response: {}", e);
                writeln!(stdout, "{}", FALLBACK_ERROR)?;
            }
        }
        stdout.flush()
    }

    /// Serve until stdin closes.
    pub async fn run(self, mut server: McpServer) -> io::Result<()> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let reader = BufReader::new(stdin.lock());
        let mut stdout = stdout.lock();

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("failed to read line: {}", e);
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            debug!("received {} bytes", line.len());

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("unparseable request: {}", e);
                    let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
                    Self::write_response(&mut stdout, &response)?;
                    continue;
                }
            };

            if let Some(response) = server.handle_request(request).await {
                Self::write_response(&mut stdout, &response)?;
            }
        }

        Ok(())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}
