//! Audit notification sink
//!
//! Two independent channels share one bounded in-memory queue: per-client
//! token-use messages (tokens flagged `email_on_use`) and admin-wide
//! security events. A small fixed worker pool drains the queue over SMTP
//! with a configurable inter-message delay so API responses never wait on
//! mail. Overflow drops the oldest non-critical entry; a send is retried
//! three times with exponential backoff and a final failure is logged,
//! never surfaced to any caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::SmtpConfig;

/// Queue capacity before overflow handling starts.
const QUEUE_CAPACITY: usize = 1024;

/// Send attempts per message.
const SEND_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts; doubles each retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// One queued notification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A token flagged `email_on_use` authenticated a request.
    TokenUse {
        /// Owner's address
        to: String,
        /// Token prefix; the plaintext never enters this module
        token_prefix: String,
        /// API operation name
        operation: String,
        /// Target zone
        zone: String,
        /// Caller origin
        source_ip: String,
    },
    /// An admin-wide security event (lockout, recovery exhaustion, seeding).
    Security {
        /// Subject line
        subject: String,
        /// Body text
        body: String,
    },
}

impl Notification {
    /// Security events survive overflow; token-use events do not.
    #[must_use]
    fn is_critical(&self) -> bool {
        matches!(self, Self::Security { .. })
    }
}

struct Queue {
    entries: Mutex<VecDeque<Notification>>,
    wake: Notify,
    dropped: AtomicU64,
}

/// Handle for enqueueing notifications. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    queue: Option<Arc<Queue>>,
}

impl Notifier {
    /// A notifier that silently discards everything (SMTP not configured).
    #[must_use]
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Start the worker pool and return the enqueue handle.
    #[must_use]
    pub fn start(smtp: SmtpConfig, shutdown: tokio::sync::broadcast::Sender<()>) -> Self {
        let queue = Arc::new(Queue {
            entries: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            dropped: AtomicU64::new(0),
        });

        let transport = match build_transport(&smtp) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                warn!(error = %e, "SMTP transport construction failed, notifications disabled");
                return Self::disabled();
            }
        };

        for worker in 0..smtp.workers {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            let smtp = smtp.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                debug!(worker, "notification worker started");
                loop {
                    let next = queue.entries.lock().pop_front();
                    match next {
                        Some(notification) => {
                            deliver(&transport, &smtp, notification).await;
                            tokio::time::sleep(Duration::from_millis(smtp.send_delay_ms)).await;
                        }
                        None => {
                            tokio::select! {
                                () = queue.wake.notified() => {}
                                _ = shutdown_rx.recv() => {
                                    debug!(worker, "notification worker shutting down");
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }

        Self { queue: Some(queue) }
    }

    /// Enqueue without blocking. On overflow the oldest non-critical entry
    /// is dropped and counted.
    pub fn enqueue(&self, notification: Notification) {
        let Some(ref queue) = self.queue else {
            return;
        };

        let mut entries = queue.entries.lock();
        if entries.len() >= QUEUE_CAPACITY {
            let victim = entries.iter().position(|n| !n.is_critical());
            match victim {
                Some(index) => {
                    entries.remove(index);
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
                None if !notification.is_critical() => {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                None => {
                    entries.pop_front();
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        entries.push_back(notification);
        drop(entries);
        queue.wake.notify_one();
    }

    /// Notifications dropped due to overflow since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue
            .as_ref()
            .map_or(0, |q| q.dropped.load(Ordering::Relaxed))
    }

    /// Queued but not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.entries.lock().len())
    }
}

fn build_transport(
    smtp: &SmtpConfig,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let mut builder =
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?.port(smtp.port);
    if let Some((ref user, ref pass)) = smtp.credentials {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

async fn deliver(
    transport: &AsyncSmtpTransport<Tokio1Executor>,
    smtp: &SmtpConfig,
    notification: Notification,
) {
    let Some(message) = render(smtp, &notification) else {
        return;
    };

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=SEND_ATTEMPTS {
        match transport.send(message.clone()).await {
            Ok(_) => return,
            Err(e) if attempt < SEND_ATTEMPTS => {
                debug!(attempt, error = %e, "notification send failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                warn!(error = %e, "notification delivery abandoned after retries");
            }
        }
    }
}

fn render(smtp: &SmtpConfig, notification: &Notification) -> Option<Message> {
    let from: Mailbox = smtp.from.parse().ok()?;
    let (to, subject, body) = match notification {
        Notification::TokenUse {
            to,
            token_prefix,
            operation,
            zone,
            source_ip,
        } => (
            to.clone(),
            format!("DNS API token {token_prefix} used"),
            format!(
                "Your API token {token_prefix} performed '{operation}' on zone {zone} from {source_ip}.\n\
                 If this was not you, revoke the token immediately."
            ),
        ),
        Notification::Security { subject, body } => {
            let admin = smtp.admin_to.clone()?;
            (admin, subject.clone(), body.clone())
        }
    };

    Message::builder()
        .from(from)
        .to(to.parse().ok()?)
        .subject(subject)
        .body(body)
        .ok()
}
