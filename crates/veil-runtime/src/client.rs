//! Control-socket client used by the CLI.

use std::os::unix::net::UnixStream;
use std::path::Path;

use veil_common::error::{Result, VeilError};

use crate::protocol::{Request, Response, read_int, read_string, write_int, write_string};

/// One connection to the daemon. Each request uses a fresh connection.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connects to the daemon socket.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Io`] if the daemon is not listening.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| VeilError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self { stream })
    }

    /// Sends a request without payload and returns the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub fn simple(mut self, request: Request) -> Result<Response> {
        write_int(&mut self.stream, request as i32)?;
        Ok(Response::from_code(read_int(&mut self.stream)?))
    }

    /// Sends an add or remove request.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub fn edit(mut self, request: Request, package: &str, process: &str) -> Result<Response> {
        write_int(&mut self.stream, request as i32)?;
        write_string(&mut self.stream, package)?;
        write_string(&mut self.stream, process)?;
        Ok(Response::from_code(read_int(&mut self.stream)?))
    }

    /// Lists the denylist as `package|process` strings.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails; a non-OK response is
    /// returned as `Err(response)` inside `Ok`.
    pub fn list(mut self) -> Result<std::result::Result<Vec<String>, Response>> {
        write_int(&mut self.stream, Request::List as i32)?;
        let response = Response::from_code(read_int(&mut self.stream)?);
        if response != Response::Ok {
            return Ok(Err(response));
        }
        let mut entries = Vec::new();
        loop {
            let entry = read_string(&mut self.stream)?;
            if entry.is_empty() {
                return Ok(Ok(entries));
            }
            entries.push(entry);
        }
    }
}
