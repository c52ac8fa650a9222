use super::{DistributedQueue, QueueError, QueueResult};
use crate::codec;
use crate::task::Task;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bounded in-process queue
///
/// Tasks travel serialized, as they would over a real transport, so the
/// receiver always gets a freshly decoded value. Publishers block while the
/// queue is full.
pub struct InProcessQueue {
    subject: String,
    sender: RwLock<Option<Sender<Vec<u8>>>>,
    receiver: Receiver<Vec<u8>>,
    pending_bytes: AtomicU64,
    capacity: usize,
}

impl InProcessQueue {
    pub fn new(subject: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            subject: subject.into(),
            sender: RwLock::new(Some(sender)),
            receiver,
            pending_bytes: AtomicU64::new(0),
            capacity,
        }
    }

    /// Tear down the publishing side
    ///
    /// Tasks already queued can still be received; after that every receive
    /// fails with a transport error.
    pub fn close(&self) {
        self.sender.write().take();
        tracing::debug!("Closed queue {}", self.subject);
    }

    /// Enqueue an already serialized message
    pub fn publish_raw(&self, bytes: Vec<u8>) -> QueueResult<()> {
        let sender = self
            .sender
            .read()
            .clone()
            .ok_or_else(|| self.transport_error("queue closed"))?;

        let len = bytes.len() as u64;
        self.pending_bytes.fetch_add(len, Ordering::Relaxed);
        if sender.send(bytes).is_err() {
            self.pending_bytes.fetch_sub(len, Ordering::Relaxed);
            return Err(self.transport_error("receiver disconnected"));
        }
        Ok(())
    }

    fn transport_error(&self, reason: &str) -> QueueError {
        QueueError::Transport {
            subject: self.subject.clone(),
            reason: reason.to_string(),
        }
    }

    fn accept(&self, bytes: Vec<u8>) -> QueueResult<Task> {
        self.pending_bytes
            .fetch_sub(bytes.len() as u64, Ordering::Relaxed);
        Ok(codec::decode(&bytes)?)
    }
}

impl DistributedQueue for InProcessQueue {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn publish_task(&self, task: Task) -> QueueResult<()> {
        self.publish_raw(codec::encode(&task)?)?;
        tracing::trace!("Published task {} to {}", task.task_id, self.subject);
        Ok(())
    }

    fn subscribe_task(&self) -> QueueResult<Task> {
        let bytes = self
            .receiver
            .recv()
            .map_err(|_| self.transport_error("queue closed"))?;
        self.accept(bytes)
    }

    fn subscribe_task_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Task>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(bytes) => self.accept(bytes).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.transport_error("queue closed")),
        }
    }

    fn queue_size(&self) -> u64 {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    fn queue_count(&self) -> usize {
        self.receiver.len()
    }

    fn queue_count_limit(&self) -> usize {
        self.capacity
    }

    fn clear(&self) -> QueueResult<usize> {
        let mut dropped = 0;
        while let Ok(bytes) = self.receiver.try_recv() {
            self.pending_bytes
                .fetch_sub(bytes.len() as u64, Ordering::Relaxed);
            dropped += 1;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_publish_subscribe() {
        let queue = InProcessQueue::new("TASK", 8);
        let task = Task::write("f", 0, 128).with_id(5);

        queue.publish_task(task.clone()).unwrap();
        assert_eq!(queue.queue_count(), 1);
        assert!(queue.queue_size() > 0);

        let received = queue.subscribe_task().unwrap();
        assert_eq!(received, task);
        assert_eq!(queue.queue_count(), 0);
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        let queue = InProcessQueue::new("TASK", 8);
        let start = Instant::now();
        let result = queue
            .subscribe_task_with_timeout(Duration::from_millis(20))
            .unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_closed_queue_is_transport_error() {
        let queue = InProcessQueue::new("TASK", 8);
        queue.publish_task(Task::read("f", 0, 1)).unwrap();
        queue.close();

        // Already queued tasks are still delivered
        assert!(queue
            .subscribe_task_with_timeout(Duration::from_millis(10))
            .unwrap()
            .is_some());
        assert!(matches!(
            queue.subscribe_task_with_timeout(Duration::from_millis(10)),
            Err(QueueError::Transport { .. })
        ));
        assert!(matches!(
            queue.publish_task(Task::read("f", 0, 1)),
            Err(QueueError::Transport { .. })
        ));
    }

    #[test]
    fn test_limit_and_clear() {
        let queue = InProcessQueue::new("TASK", 4);
        assert_eq!(queue.queue_count_limit(), 4);
        for i in 0..4 {
            queue.publish_task(Task::read("f", i, 1).with_id(i)).unwrap();
        }
        assert_eq!(queue.queue_count(), 4);
        assert_eq!(queue.clear().unwrap(), 4);
        assert_eq!(queue.queue_count(), 0);
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn test_full_queue_blocks_publisher() {
        let queue = Arc::new(InProcessQueue::new("TASK", 1));
        queue.publish_task(Task::read("f", 0, 1).with_id(1)).unwrap();

        let publisher = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.publish_task(Task::read("f", 1, 1).with_id(2)))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.queue_count(), 1);

        let first = queue.subscribe_task().unwrap();
        publisher.join().unwrap().unwrap();
        let second = queue.subscribe_task().unwrap();
        assert_eq!((first.task_id, second.task_id), (1, 2));
    }
}
