//! IPC client implementation

use std::path::Path;
use tally_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::{IpcError, IpcResult};

/// IPC Client for connecting to tallyd
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        let response: Response = serde_json::from_str(line.trim())?;
        if response.request_id != request_id {
            return Err(IpcError::InvalidMessage(format!(
                "expected response to request {request_id}, got {}",
                response.request_id
            )));
        }
        Ok(response)
    }

    /// Like [`IpcClient::send`], with an error response turned into an error
    pub async fn request(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::ServerError(e.message)),
        }
    }

    /// Subscribe to events and consume this client to return an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        self.request(Command::SubscribeEvents).await?;
        Ok(EventStream {
            reader: self.reader,
        })
    }
}

/// Stream of events from tallyd
pub struct EventStream {
    reader: BufReader<OwnedReadHalf>,
}

impl EventStream {
    /// Wait for the next event
    pub async fn next(&mut self) -> IpcResult<Event> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::ConnectionClosed);
        }

        let event: Event = serde_json::from_str(line.trim())?;
        Ok(event)
    }
}
