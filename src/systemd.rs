//! sd_notify messages for the worker.
//!
//! Every call is a no-op when notification is disabled or off Linux.

/// Job counts reported in the systemd status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub running: usize,
    pub queued: usize,
}

impl WorkerStatus {
    pub fn status_line(&self) -> String {
        match (self.running, self.queued) {
            (0, 0) => "Idle, waiting for jobs".to_string(),
            (running, queued) => format!("{} job(s) running, {} queued", running, queued),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`: the worker holds its lock and is admitting jobs.
    pub fn ready(&self) {
        self.send("READY", &[Message::Ready]);
    }

    /// `STOPPING=1`: shutdown has begun.
    pub fn stopping(&self) {
        self.send("STOPPING", &[Message::Stopping]);
    }

    pub fn status(&self, status: &WorkerStatus) {
        let line = status.status_line();
        self.send("STATUS", &[Message::Status(&line)]);
    }

    fn send(&self, what: &str, messages: &[Message<'_>]) {
        if !self.enabled {
            return;
        }
        if let Err(e) = notify(messages) {
            tracing::debug!(error = %e, message = what, "sd_notify failed");
        }
    }
}

enum Message<'a> {
    Ready,
    Stopping,
    Status(&'a str),
}

#[cfg(target_os = "linux")]
fn notify(messages: &[Message<'_>]) -> std::io::Result<()> {
    use sd_notify::NotifyState;
    let states: Vec<NotifyState<'_>> = messages
        .iter()
        .map(|m| match m {
            Message::Ready => NotifyState::Ready,
            Message::Stopping => NotifyState::Stopping,
            Message::Status(line) => NotifyState::Status(line),
        })
        .collect();
    sd_notify::notify(false, &states)
}

#[cfg(not(target_os = "linux"))]
fn notify(_messages: &[Message<'_>]) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_formats_counts() {
        assert_eq!(WorkerStatus::default().status_line(), "Idle, waiting for jobs");
        let busy = WorkerStatus {
            running: 2,
            queued: 5,
        };
        assert_eq!(busy.status_line(), "2 job(s) running, 5 queued");
    }

    #[test]
    fn notifier_without_socket_does_not_panic() {
        for enabled in [false, true] {
            let n = SystemdNotifier::new(enabled);
            n.ready();
            n.status(&WorkerStatus::default());
            n.stopping();
        }
    }
}
