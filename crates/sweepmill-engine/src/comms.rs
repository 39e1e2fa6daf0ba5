//! The communication server.
//!
//! Running jobs report their lifecycle over UDP: one datagram per event,
//! encoded as a `(u8 message code, payload)` pair. The server owns the
//! socket on its own task, decodes datagrams into [`Message`] values, and
//! forwards them over a bounded channel to the orchestrator, which is the
//! only writer of job state.
//!
//! The wire encoding is bincode: a single leading code byte followed by the
//! bincode serialization of the payload tuple. Senders and receivers must
//! agree on this encoding.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

/// The maximum size of a single datagram.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// The capacity of the server-to-orchestrator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A lifecycle message sent by a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// The job started executing on a host.
    JobStarted {
        /// The id of the reporting job.
        job_id: usize,
        /// The host the job is executing on.
        hostname: String,
    },
    /// The job ran into an error.
    ErrorEncountered {
        /// The id of the reporting job.
        job_id: usize,
        /// The lines of the error text (e.g. a traceback).
        lines: Vec<String>,
    },
    /// The job reported its final metrics.
    JobSentResults {
        /// The id of the reporting job.
        job_id: usize,
        /// The final metric values.
        metrics: IndexMap<String, f64>,
    },
    /// The job finished.
    JobConcluded {
        /// The id of the reporting job.
        job_id: usize,
    },
    /// The job exited voluntarily and asks to be resumed.
    ExitForResume {
        /// The id of the reporting job.
        job_id: usize,
    },
    /// The job reported its progress as a fraction in `(0, 1]`.
    JobProgress {
        /// The id of the reporting job.
        job_id: usize,
        /// The fraction of work done.
        fraction: f64,
    },
    /// The job reported intermediate metric values.
    MetricEarlyReport {
        /// The id of the reporting job.
        job_id: usize,
        /// The intermediate metric values.
        metrics: IndexMap<String, f64>,
    },
}

impl Message {
    /// Gets the wire code of the message.
    pub fn code(&self) -> u8 {
        match self {
            Self::JobStarted { .. } => 0,
            Self::ErrorEncountered { .. } => 1,
            Self::JobSentResults { .. } => 2,
            Self::JobConcluded { .. } => 3,
            Self::ExitForResume { .. } => 4,
            Self::JobProgress { .. } => 5,
            Self::MetricEarlyReport { .. } => 6,
        }
    }

    /// Encodes the message for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.code()];
        match self {
            Self::JobStarted { job_id, hostname } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64, hostname))?;
            }
            Self::ErrorEncountered { job_id, lines } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64, lines))?;
            }
            Self::JobSentResults { job_id, metrics } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64, metrics))?;
            }
            Self::JobConcluded { job_id } | Self::ExitForResume { job_id } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64,))?;
            }
            Self::JobProgress { job_id, fraction } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64, *fraction))?;
            }
            Self::MetricEarlyReport { job_id, metrics } => {
                bincode::serialize_into(&mut buf, &(*job_id as u64, metrics))?;
            }
        }
        Ok(buf)
    }

    /// Decodes a datagram into a message.
    ///
    /// Unknown codes and malformed payloads are errors; the server logs and
    /// ignores them.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (code, payload) = data.split_first().context("empty datagram")?;
        let message = match code {
            0 => {
                let (job_id, hostname): (u64, String) = bincode::deserialize(payload)?;
                Self::JobStarted {
                    job_id: job_id as usize,
                    hostname,
                }
            }
            1 => {
                let (job_id, lines): (u64, Vec<String>) = bincode::deserialize(payload)?;
                Self::ErrorEncountered {
                    job_id: job_id as usize,
                    lines,
                }
            }
            2 => {
                let (job_id, metrics): (u64, IndexMap<String, f64>) =
                    bincode::deserialize(payload)?;
                Self::JobSentResults {
                    job_id: job_id as usize,
                    metrics,
                }
            }
            3 => {
                let (job_id,): (u64,) = bincode::deserialize(payload)?;
                Self::JobConcluded {
                    job_id: job_id as usize,
                }
            }
            4 => {
                let (job_id,): (u64,) = bincode::deserialize(payload)?;
                Self::ExitForResume {
                    job_id: job_id as usize,
                }
            }
            5 => {
                let (job_id, fraction): (u64, f64) = bincode::deserialize(payload)?;
                Self::JobProgress {
                    job_id: job_id as usize,
                    fraction,
                }
            }
            6 => {
                let (job_id, metrics): (u64, IndexMap<String, f64>) =
                    bincode::deserialize(payload)?;
                Self::MetricEarlyReport {
                    job_id: job_id as usize,
                    metrics,
                }
            }
            other => bail!("unknown message code `{other}`"),
        };
        Ok(message)
    }
}

/// An event delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A message arrived from a job.
    Message(Message),
    /// The grace window of a concluded-without-results job elapsed.
    GraceExpired {
        /// The id of the affected job.
        job_id: usize,
    },
}

/// The handle to a running communication server.
///
/// Dropping the handle (or calling [`CommunicationServer::shutdown`]) stops
/// the server task and closes the socket.
#[derive(Debug)]
pub struct CommunicationServer {
    /// The address jobs send their messages to.
    connection_info: SocketAddr,
    /// The sender side of the event channel.
    ///
    /// Also used to inject synthetic messages (e.g. from the interactive
    /// console) and by grace timers.
    sender: mpsc::Sender<Event>,
    /// Cancelling this token stops the server task.
    cancellation: CancellationToken,
}

impl CommunicationServer {
    /// Binds the server to the host's outbound interface on a kernel-chosen
    /// port and spawns its task.
    ///
    /// Returns the server handle and the receiver of decoded events.
    pub async fn bind() -> Result<(Self, mpsc::Receiver<Event>)> {
        Self::bind_to(local_ip()).await
    }

    /// Binds the server to a specific address on a kernel-chosen port.
    pub async fn bind_to(ip: IpAddr) -> Result<(Self, mpsc::Receiver<Event>)> {
        let socket = UdpSocket::bind((ip, 0))
            .await
            .with_context(|| format!("failed to bind UDP socket on `{ip}`"))?;
        let connection_info = socket.local_addr().context("failed to read socket address")?;
        info!("communication happening on {connection_info}");

        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancellation = CancellationToken::new();

        tokio::spawn(Self::run(socket, sender.clone(), cancellation.clone()));

        Ok((
            Self {
                connection_info,
                sender,
                cancellation,
            },
            receiver,
        ))
    }

    /// The `(ip, port)` jobs send their messages to.
    pub fn connection_info(&self) -> SocketAddr {
        self.connection_info
    }

    /// Gets a sender for injecting events into the orchestrator channel.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    /// Stops the server task and closes the socket.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// The server task: receives datagrams until cancelled.
    async fn run(socket: UdpSocket, sender: mpsc::Sender<Event>, cancellation: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            error!("failed to receive datagram: {e}");
                            continue;
                        }
                    };

                    let message = match Message::decode(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            error!("received a message from {peer} I did not understand: {e:#}");
                            continue;
                        }
                    };

                    debug!("received {message:?} from {peer}");
                    if sender.send(Event::Message(message)).await.is_err() {
                        // The orchestrator is gone; nothing left to serve.
                        break;
                    }
                }
            }
        }

        debug!("communication server has shut down");
    }
}

impl Drop for CommunicationServer {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Determines the IP of the host's outbound interface.
///
/// Opens a UDP socket towards a non-routable address; no traffic is actually
/// sent. Falls back to the loopback address.
pub fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            Ok(socket.local_addr()?.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn codec_round_trip() {
        let metrics: IndexMap<String, f64> = [("loss".to_string(), 0.125)].into_iter().collect();
        let messages = [
            Message::JobStarted {
                job_id: 1,
                hostname: "node-07".to_string(),
            },
            Message::ErrorEncountered {
                job_id: 2,
                lines: vec!["Traceback".to_string(), "ValueError".to_string()],
            },
            Message::JobSentResults {
                job_id: 3,
                metrics: metrics.clone(),
            },
            Message::JobConcluded { job_id: 4 },
            Message::ExitForResume { job_id: 5 },
            Message::JobProgress {
                job_id: 6,
                fraction: 0.5,
            },
            Message::MetricEarlyReport {
                job_id: 7,
                metrics,
            },
        ];

        for message in messages {
            let encoded = message.encode().expect("should encode");
            assert_eq!(encoded[0], message.code());
            let decoded = Message::decode(&encoded).expect("should decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(Message::decode(&[42, 0, 0]).is_err());
        assert!(Message::decode(&[]).is_err());
    }

    #[tokio::test]
    async fn server_forwards_decoded_messages() {
        let (server, mut events) = CommunicationServer::bind_to(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .expect("should bind");

        let client = std::net::UdpSocket::bind("127.0.0.1:0").expect("should bind client");
        let message = Message::JobStarted {
            job_id: 11,
            hostname: "worker".to_string(),
        };
        client
            .send_to(&message.encode().unwrap(), server.connection_info())
            .expect("should send");

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("should not time out")
            .expect("channel should be open");
        assert_eq!(event, Event::Message(message));

        server.shutdown();
    }

    #[tokio::test]
    async fn garbage_datagrams_are_ignored() {
        let (server, mut events) = CommunicationServer::bind_to(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .expect("should bind");

        let client = std::net::UdpSocket::bind("127.0.0.1:0").expect("should bind client");
        client
            .send_to(&[99, 1, 2, 3], server.connection_info())
            .expect("should send");
        let message = Message::JobConcluded { job_id: 0 };
        client
            .send_to(&message.encode().unwrap(), server.connection_info())
            .expect("should send");

        // Only the valid message comes through.
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("should not time out")
            .expect("channel should be open");
        assert_eq!(event, Event::Message(message));
    }
}
