use tokio::sync::watch;

/// Running transcript of the model's current turn.
pub struct TranscriptSink {
    tx: watch::Sender<String>,
}

impl TranscriptSink {
    pub fn new(tx: watch::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn append(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.tx.send_modify(|text| {
            let needs_space = !text.is_empty()
                && !text.ends_with(char::is_whitespace)
                && !delta.starts_with(char::is_whitespace);
            if needs_space {
                text.push(' ');
            }
            text.push_str(delta);
        });
    }

    pub fn reset(&self) {
        self.tx.send_if_modified(|text| {
            if text.is_empty() {
                return false;
            }
            text.clear();
            true
        });
    }
}
