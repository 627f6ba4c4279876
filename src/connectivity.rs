//! Process-wide online/offline signal.
//!
//! One [`ConnectivityMonitor`] owns the value. Everything else holds a
//! [`Connectivity`] handle, which can read and wait for changes but never
//! write.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConnectivityConfig;

/// Sole writer of the connectivity signal
#[derive(Debug)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

/// Read-only view of the connectivity signal
#[derive(Debug, Clone)]
pub struct Connectivity {
  rx: watch::Receiver<bool>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> (Self, Connectivity) {
    let (tx, rx) = watch::channel(online);
    (Self { tx }, Connectivity { rx })
  }

  pub fn subscribe(&self) -> Connectivity {
    Connectivity {
      rx: self.tx.subscribe(),
    }
  }

  /// Returns true if the value changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Move the monitor into a task that probes `config.probe_addr` on an
  /// interval until `cancel` fires.
  pub fn spawn_probe(self, config: ConnectivityConfig, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(config.probe_interval_secs.max(1)));
      loop {
        tokio::select! {
          _ = cancel.cancelled() => {
            debug!("Connectivity probe stopping");
            break;
          }
          _ = interval.tick() => {
            let online = probe(&config).await;
            self.set_online(online);
          }
        }
      }
    })
  }
}

impl Connectivity {
  /// A signal that never changes.
  pub fn fixed(online: bool) -> Self {
    let (_, connectivity) = ConnectivityMonitor::new(online);
    connectivity
  }

  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }

  pub fn is_offline(&self) -> bool {
    !self.is_online()
  }

  /// Wait for the next change. Returns `None` once the monitor is gone.
  pub async fn changed(&mut self) -> Option<bool> {
    self.rx.changed().await.ok()?;
    Some(*self.rx.borrow_and_update())
  }
}

/// One TCP connect attempt against the probe address.
pub async fn probe(config: &ConnectivityConfig) -> bool {
  let timeout = Duration::from_millis(config.probe_timeout_ms);
  match tokio::time::timeout(timeout, TcpStream::connect(config.probe_addr.as_str())).await {
    Ok(Ok(_)) => true,
    Ok(Err(e)) => {
      debug!(addr = %config.probe_addr, error = %e, "Connectivity probe failed");
      false
    }
    Err(_) => {
      debug!(addr = %config.probe_addr, "Connectivity probe timed out");
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_readers_observe_single_writer() {
    let (monitor, mut reader) = ConnectivityMonitor::new(true);
    let other = monitor.subscribe();
    assert!(reader.is_online());

    assert!(monitor.set_online(false));
    assert_eq!(reader.changed().await, Some(false));
    assert!(other.is_offline());

    // Same value again is not a change
    assert!(!monitor.set_online(false));
  }

  #[tokio::test]
  async fn test_changed_ends_when_monitor_dropped() {
    let (monitor, mut reader) = ConnectivityMonitor::new(true);
    drop(monitor);
    assert_eq!(reader.changed().await, None);
    assert!(reader.is_online());
  }

  #[test]
  fn test_fixed_signal() {
    assert!(Connectivity::fixed(false).is_offline());
    assert!(Connectivity::fixed(true).is_online());
  }

  #[tokio::test]
  async fn test_probe_against_local_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ConnectivityConfig {
      probe_addr: listener.local_addr().unwrap().to_string(),
      probe_interval_secs: 1,
      probe_timeout_ms: 500,
    };
    assert!(probe(&config).await);

    drop(listener);
    assert!(!probe(&config).await);
  }

  #[tokio::test]
  async fn test_probe_task_publishes_and_stops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ConnectivityConfig {
      probe_addr: listener.local_addr().unwrap().to_string(),
      probe_interval_secs: 1,
      probe_timeout_ms: 500,
    };
    let (monitor, mut reader) = ConnectivityMonitor::new(false);
    let cancel = CancellationToken::new();
    let handle = monitor.spawn_probe(config, cancel.clone());

    assert_eq!(reader.changed().await, Some(true));
    cancel.cancel();
    handle.await.unwrap();
  }
}
