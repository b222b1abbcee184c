//! Alert dispatch to the buzzer peer.
//!
//! `alert` never blocks the detection loop: patterns go into a bounded queue and a
//! worker thread performs `GET {alert_url}?pattern={n}`. Delivery failures are
//! logged and counted, never returned to the caller. A full queue drops the alert.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::Serialize;
use url::Url;

use crate::error::WatchError;

const QUEUE_DEPTH: usize = 8;

/// Delivery counters of a dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounters {
    pub alerts_sent: u64,
    pub alert_failures: u64,
    pub alerts_dropped: u64,
    pub last_alert: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Fire-and-forget alert sink.
pub trait AlertDispatcher: Send + Sync {
    /// Queue an alert with the given buzzer pattern.
    fn alert(&self, pattern: u8);

    fn counters(&self) -> AlertCounters;
}

/// HTTP client for the ESP32 buzzer peer.
pub struct HttpBuzzer {
    alert_url: Url,
    agent: ureq::Agent,
    sender: Option<Sender<u8>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Mutex<AlertCounters>>,
}

impl HttpBuzzer {
    /// `alert_url` is the peer's alert endpoint, e.g. `http://192.168.1.101/alert`.
    /// `/test` and `/status` are resolved next to it.
    pub fn new(alert_url: &str, timeout: Duration) -> Result<Self> {
        let alert_url =
            Url::parse(alert_url).with_context(|| format!("parse buzzer url {}", alert_url))?;
        if !matches!(alert_url.scheme(), "http" | "https") {
            return Err(anyhow!("buzzer url must be http(s): {}", alert_url));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        let counters = Arc::new(Mutex::new(AlertCounters::default()));
        let (sender, receiver) = bounded::<u8>(QUEUE_DEPTH);

        let worker = {
            let agent = agent.clone();
            let url = alert_url.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("buzzer".to_string())
                .spawn(move || {
                    for pattern in receiver {
                        let outcome = send_pattern(&agent, &url, pattern);
                        let Ok(mut counters) = counters.lock() else {
                            return;
                        };
                        match outcome {
                            Ok(()) => {
                                log::info!("HttpBuzzer: alert sent (pattern {})", pattern);
                                counters.alerts_sent += 1;
                                counters.last_alert = Some(Local::now());
                                counters.last_error = None;
                            }
                            Err(err) => {
                                log::error!("HttpBuzzer: {}", err);
                                counters.alert_failures += 1;
                                counters.last_error = Some(err.to_string());
                            }
                        }
                    }
                })
                .context("spawn buzzer worker")?
        };

        Ok(Self {
            alert_url,
            agent,
            sender: Some(sender),
            worker: Some(worker),
            counters,
        })
    }

    fn sibling(&self, endpoint: &str) -> Result<Url> {
        self.alert_url
            .join(endpoint)
            .with_context(|| format!("resolve {} next to {}", endpoint, self.alert_url))
    }

    /// Ask the buzzer to play its test tone. Synchronous.
    pub fn test(&self) -> Result<()> {
        let url = self.sibling("test")?;
        self.agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("buzzer test via {}", url))?;
        log::info!("HttpBuzzer: buzzer test successful");
        Ok(())
    }

    /// Fetch the peer's JSON status document. Synchronous.
    pub fn status(&self) -> Result<serde_json::Value> {
        let url = self.sibling("status")?;
        let body = self
            .agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("buzzer status via {}", url))?
            .into_string()
            .context("read buzzer status body")?;
        serde_json::from_str(&body).context("parse buzzer status json")
    }
}

impl AlertDispatcher for HttpBuzzer {
    fn alert(&self, pattern: u8) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        match sender.try_send(pattern) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                log::warn!("HttpBuzzer: alert queue unavailable, dropping pattern {}", pattern);
                if let Ok(mut counters) = self.counters.lock() {
                    counters.alerts_dropped += 1;
                }
            }
        }
    }

    fn counters(&self) -> AlertCounters {
        self.counters
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Drop for HttpBuzzer {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn send_pattern(agent: &ureq::Agent, url: &Url, pattern: u8) -> std::result::Result<(), WatchError> {
    let mut target = url.clone();
    target
        .query_pairs_mut()
        .append_pair("pattern", &pattern.to_string());
    agent
        .get(target.as_str())
        .call()
        .map(|_| ())
        .map_err(|err| WatchError::AlertDeliveryFailure {
            target: target.to_string(),
            reason: err.to_string(),
        })
}

/// Dispatcher that records patterns in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct RecordingDispatcher {
    patterns: Mutex<Vec<u8>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> Vec<u8> {
        self.patterns.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl AlertDispatcher for RecordingDispatcher {
    fn alert(&self, pattern: u8) {
        log::info!("RecordingDispatcher: alert pattern {}", pattern);
        if let Ok(mut patterns) = self.patterns.lock() {
            patterns.push(pattern);
        }
    }

    fn counters(&self) -> AlertCounters {
        let patterns = self.patterns();
        AlertCounters {
            alerts_sent: patterns.len() as u64,
            ..AlertCounters::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn alert_reaches_peer_with_pattern_query() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = std::thread::spawn(move || -> String {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).expect("read");
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .expect("write");
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let buzzer = HttpBuzzer::new(&format!("http://{}/alert", addr), Duration::from_secs(2))?;
        buzzer.alert(3);
        let request = server.join().expect("server thread");
        assert!(request.starts_with("GET /alert?pattern=3 "), "{}", request);
        assert!(wait_for(|| buzzer.counters().alerts_sent == 1));
        Ok(())
    }

    #[test]
    fn unreachable_peer_is_counted_not_propagated() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let buzzer = HttpBuzzer::new(&format!("http://{}/alert", addr), Duration::from_millis(200))?;
        buzzer.alert(1);
        assert!(wait_for(|| buzzer.counters().alert_failures == 1));
        assert!(buzzer.counters().last_error.is_some());
        assert!(buzzer.test().is_err());
        Ok(())
    }

    #[test]
    fn sibling_endpoints_resolve_next_to_alert_url() -> Result<()> {
        let buzzer = HttpBuzzer::new("http://10.0.0.9/alert", Duration::from_secs(1))?;
        assert_eq!(buzzer.sibling("status")?.as_str(), "http://10.0.0.9/status");
        Ok(())
    }

    #[test]
    fn recording_dispatcher_keeps_patterns() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.alert(2);
        assert_eq!(dispatcher.patterns(), vec![2]);
        assert_eq!(dispatcher.counters().alerts_sent, 1);
    }
}
