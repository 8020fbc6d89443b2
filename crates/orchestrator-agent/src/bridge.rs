//! Bounded queue + wakeup primitive bridging the master's `user_message`
//! frames into the agent backend's turn loop (spec §9 "Async iterator
//! bridging the user-prompt stream into the agent SDK"). The Internal WS
//! Hub read loop is the producer; `AgentBackend::run` is the sole consumer.
//! Dropping the producer half signals end-of-stream the way a closed
//! iterator would, so the consumer's `next()` resolves to `None` instead of
//! hanging forever.

use tokio::sync::mpsc;

/// Producer half: appends prompts. Cloned freely; the stream only closes
/// once every clone has been dropped.
#[derive(Clone)]
pub struct PromptSink {
    tx: mpsc::Sender<String>,
}

impl PromptSink {
    /// Backpressures the producer (the WS read loop) if the backend is
    /// behind, rather than buffering unboundedly — bounded per spec's
    /// "bounded queue" wording.
    pub async fn push(&self, content: String) {
        // The only failure mode is every receiver having been dropped,
        // which only happens at shutdown; nothing to retry into at that
        // point.
        let _ = self.tx.send(content).await;
    }
}

/// Consumer half: the agent backend's turn loop pulls from this.
pub struct PromptStream {
    rx: mpsc::Receiver<String>,
}

impl PromptStream {
    /// `None` once the sink side has been fully dropped (end-of-stream).
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

pub fn bounded_prompt_queue(capacity: usize) -> (PromptSink, PromptStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (PromptSink { tx }, PromptStream { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushed_prompts_arrive_in_order() {
        let (sink, mut stream) = bounded_prompt_queue(4);
        sink.push("one".into()).await;
        sink.push("two".into()).await;
        assert_eq!(stream.next().await, Some("one".to_string()));
        assert_eq!(stream.next().await, Some("two".to_string()));
    }

    #[tokio::test]
    async fn dropping_sink_ends_the_stream() {
        let (sink, mut stream) = bounded_prompt_queue(4);
        sink.push("one".into()).await;
        drop(sink);
        assert_eq!(stream.next().await, Some("one".to_string()));
        assert_eq!(stream.next().await, None);
    }
}
