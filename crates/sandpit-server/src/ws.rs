//! Websocket adapter for run sessions
//!
//! Maps websocket messages onto the transport-agnostic frames of
//! [`sandpit_core::mux`] and back. The inbound half is pumped on its own
//! task so a client that disconnects mid-run is noticed even while the
//! program is not reading its input.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sandpit_core::mux::{FrameWriter, InboundFrame, OutputChannels, StdinReader};
use sandpit_core::Playground;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_BUFFER: usize = 16;
const INBOUND_BACKLOG: usize = 64;
const OUTBOUND_BUFFER: usize = 64;

/// Query parameters of `GET /run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub token: Option<String>,
    pub args: Vec<String>,
}

impl RunQuery {
    /// Parse a raw query string such as `token=42&args=a&args=b`.
    ///
    /// The first `token` wins; every `args` value is kept in order.
    pub fn parse(query: &str) -> Self {
        let mut parsed = RunQuery::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode_component(value);
            match decode_component(key).as_str() {
                "token" if parsed.token.is_none() => parsed.token = Some(value),
                "args" => parsed.args.push(value),
                _ => {}
            }
        }
        parsed
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Drive one run over an upgraded connection.
///
/// Output frames are forwarded as text messages; when the run is over the
/// connection is closed with the run's close status.
pub async fn run_session<Tx, Rx, E>(playground: Arc<Playground>, query: RunQuery, mut sink: Tx, stream: Rx)
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let pump = tokio::spawn(pump_inbound(stream, inbound_tx, cancel.clone()));

    let OutputChannels {
        stdout,
        stderr,
        frames,
    } = FrameWriter::channels(OUTBOUND_BUFFER);

    let outbound = async {
        let mut frames = frames;
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Could not encode output frame: {}", e);
                    break;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                // Dropping the receiver makes the writers fail, which stops the run.
                log::debug!("Could not send output frame: {}", e);
                break;
            }
        }
    };

    let run = playground.run(
        query.token.as_deref(),
        query.args,
        StdinReader::from_channel(inbound_rx),
        stdout,
        stderr,
        cancel.clone(),
    );
    let (status, ()) = tokio::join!(run, outbound);

    log::info!("Closing run connection: {} {}", status.code, status.reason);
    let close = Message::Close(Some(CloseFrame {
        code: status.code,
        reason: status.reason.into(),
    }));
    if let Err(e) = sink.send(close).await {
        log::debug!("Could not send close frame: {}", e);
    }
    let _ = sink.close().await;
    pump.abort();
}

async fn pump_inbound<Rx, E>(mut stream: Rx, frames: mpsc::Sender<InboundFrame>, cancel: CancellationToken)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    // Frames waiting for the stdin relay. The connection keeps being read
    // while they wait, so a disconnect is seen even when the program has
    // stopped reading its input.
    let mut backlog = VecDeque::new();
    loop {
        let message = if backlog.is_empty() {
            stream.next().await
        } else {
            tokio::select! {
                permit = frames.reserve() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(frame) = backlog.pop_front() {
                                permit.send(frame);
                            }
                        }
                        // Stdin has ended; nobody reads frames any more.
                        Err(_) => backlog.clear(),
                    }
                    continue;
                }
                message = stream.next() => message,
            }
        };

        let frame = match message {
            Some(Ok(Message::Text(text))) => InboundFrame::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => InboundFrame::Binary(data),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| f.code);
                log::debug!("Client closed the run connection with {:?}", code);
                let _ = frames.try_send(InboundFrame::Closed { code });
                break;
            }
            Some(Err(e)) => {
                log::debug!("Run connection failed: {}", e);
                break;
            }
            None => {
                log::debug!("Run connection ended");
                break;
            }
        };

        if frames.is_closed() {
            continue;
        }
        if backlog.len() < INBOUND_BACKLOG {
            backlog.push_back(frame);
        } else {
            log::warn!("Program is not reading its input; dropping a stdin frame");
        }
    }
    cancel.cancel();
}
