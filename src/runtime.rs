// Zenoh transport for the robot service
//
// - RPC: a queryable on KEY_RPC; each query carries one JSON Request and gets one JSON Reply.
//   Queries are served on their own tasks so a long drive does not block a stop on other ports.
// - Streamed drive: updates are published on KEY_DRIVE_STREAM/<id>. The first update of an
//   unknown id opens a session; the final StatusResult goes to KEY_DRIVE_STREAM/<id>/status.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use zenoh::query::Query;
use zenoh::sample::Sample;
use zenoh::Session;

use crate::config::{STATUS_SUFFIX, STREAM_CHANNEL_CAPACITY};
use crate::control::ControlError;
use crate::messages::{DriveUpdate, Reply, Request, StatusResult};
use crate::robot::Robot;

/// Key expressions the runtime listens on
#[derive(Debug, Clone)]
pub struct Keys {
    pub rpc: String,
    pub drive_stream: String,
}

impl Keys {
    pub fn status_key(&self, stream_id: &str) -> String {
        format!("{}/{}/{}", self.drive_stream, stream_id, STATUS_SUFFIX)
    }
}

fn parse_request(payload: Option<&[u8]>) -> Result<Request, ControlError> {
    let payload = payload.ok_or_else(|| ControlError::InvalidRequest("empty query".to_string()))?;
    serde_json::from_slice(payload).map_err(|e| ControlError::InvalidRequest(e.to_string()))
}

async fn serve_query(robot: Robot, query: Query) {
    let payload = query.payload().map(|p| p.to_bytes().into_owned());
    let reply = match parse_request(payload.as_deref()) {
        Ok(request) => robot.handle(request).await,
        Err(e) => {
            warn!("Rejected query on {}: {}", query.key_expr(), e);
            Reply::Status(StatusResult::failure(&e))
        }
    };

    let json = match serde_json::to_string(&reply) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = query.reply(query.key_expr().clone(), json).await {
        error!("Failed to send reply: {}", e);
    }
}

/// Stream id is the last chunk of the sample's key
fn stream_id<'k>(key: &'k str, prefix: &str) -> Option<&'k str> {
    let id = key.strip_prefix(prefix)?.strip_prefix('/')?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Queue an update for a running session. Returns false once the session is gone.
///
/// A full queue drops ordinary updates, but an update that ends the stream is
/// always delivered, behind whatever is already queued.
fn deliver(sender: &mpsc::Sender<DriveUpdate>, update: DriveUpdate, id: &str) -> bool {
    match sender.try_send(update) {
        Ok(()) => true,
        Err(TrySendError::Full(update)) if update.ends_stream() => {
            debug!("Stream {} is behind, queueing its final update", id);
            let sender = sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(update).await;
            });
            true
        }
        Err(TrySendError::Full(_)) => {
            warn!("Stream {} is behind, dropping update", id);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Open drive streams, by id
struct Streams {
    senders: HashMap<String, mpsc::Sender<DriveUpdate>>,
}

impl Streams {
    fn new() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }

    /// Route one sample to its session, opening a session for a new id
    fn route(&mut self, sample: &Sample, keys: &Keys, robot: &Robot, session: &Session) {
        let key = sample.key_expr().as_str();
        let Some(id) = stream_id(key, &keys.drive_stream) else {
            debug!("Ignoring sample on {}", key);
            return;
        };

        let payload = sample.payload().to_bytes();
        let update = match serde_json::from_slice::<DriveUpdate>(&payload) {
            Ok(update) => update,
            Err(e) => {
                // Dropping the sender ends the session at its next receive
                warn!("Malformed update on stream {}, closing it: {}", id, e);
                self.senders.remove(id);
                return;
            }
        };

        // Sessions that already finished leave a closed sender behind
        self.senders.retain(|_, sender| !sender.is_closed());

        if let Some(sender) = self.senders.get(id) {
            if !deliver(sender, update, id) {
                self.senders.remove(id);
            }
            return;
        }

        if update.close {
            debug!("Close for unknown stream {}", id);
            return;
        }

        info!("Opening drive stream {}", id);
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        if sender.try_send(update).is_err() {
            return;
        }
        self.senders.insert(id.to_string(), sender);

        let robot = robot.clone();
        let session = session.clone();
        let status_key = keys.status_key(id);
        tokio::spawn(async move {
            let status = robot.drive_stream(receiver).await;
            info!("Drive stream finished: {:?}", status);
            match serde_json::to_string(&status) {
                Ok(json) => {
                    if let Err(e) = session.put(status_key, json).await {
                        error!("Failed to publish stream status: {}", e);
                    }
                }
                Err(e) => error!("Failed to encode stream status: {}", e),
            }
        });
    }
}

pub async fn run(robot: Robot, keys: Keys) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Declaring queryable and stream subscriber...");
    let queryable = session.declare_queryable(keys.rpc.as_str()).await?;
    let stream_subscriber = session
        .declare_subscriber(format!("{}/*", keys.drive_stream))
        .await?;

    info!("Serving requests on: {}", keys.rpc);
    info!("Accepting drive streams on: {}/<id>", keys.drive_stream);

    let mut streams = Streams::new();
    loop {
        tokio::select! {
            query = queryable.recv_async() => {
                let query = query?;
                tokio::spawn(serve_query(robot.clone(), query));
            }
            sample = stream_subscriber.recv_async() => {
                let sample = sample?;
                streams.route(&sample, &keys, &robot, &session);
            }
        }
    }
}
