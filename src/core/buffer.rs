use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A snapshot waiting to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    /// `data:image/jpeg;base64,...`
    pub data: String,
    pub captured_at: Instant,
}

impl CapturedImage {
    pub fn new(data: impl Into<String>, captured_at: Instant) -> Self {
        Self { data: data.into(), captured_at }
    }
}

/// Bounded FIFO of captured images with optional age-based eviction.
///
/// Time is passed in explicitly, so the ring has no clock of its own.
#[derive(Debug)]
pub struct ImageRing {
    images: VecDeque<CapturedImage>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl ImageRing {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self { images: VecDeque::with_capacity(capacity), capacity, ttl }
    }

    /// Collects expired images, appends, then drops the oldest while over
    /// capacity. Returns the resulting length.
    pub fn push(&mut self, image: CapturedImage, now: Instant) -> usize {
        self.garbage_collect(now);
        self.images.push_back(image);
        while self.images.len() > self.capacity {
            self.images.pop_front();
        }
        self.images.len()
    }

    /// Removes every image older than the TTL. Survivors keep their order.
    pub fn garbage_collect(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.images.len();
        self.images
            .retain(|image| now.saturating_duration_since(image.captured_at) <= ttl);
        before - self.images.len()
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }

    pub fn take(&mut self) -> Vec<CapturedImage> {
        self.images.drain(..).collect()
    }

    pub fn remove(&mut self, index: usize) -> Option<CapturedImage> {
        self.images.remove(index)
    }

    /// Removes the given images if still present. Returns how many went.
    pub fn discard(&mut self, submitted: &[CapturedImage]) -> usize {
        let before = self.images.len();
        self.images.retain(|image| !submitted.contains(image));
        before - self.images.len()
    }

    pub fn snapshot(&self) -> Vec<CapturedImage> {
        self.images.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

struct Inner {
    ring: ImageRing,
    sweeper: Option<CancellationToken>,
}

impl Inner {
    fn stop_sweeper(&mut self) {
        if let Some(token) = self.sweeper.take() {
            token.cancel();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Shared capture buffer.
///
/// With a TTL, a background sweeper runs every `ttl / 3` while the buffer
/// holds anything. It starts on the first image and stops once the buffer
/// drains, is cleared, or the last handle is dropped.
#[derive(Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl CaptureBuffer {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ring: ImageRing::new(capacity, ttl),
                sweeper: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a data URI captured now.
    pub fn push(&self, data: impl Into<String>) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let count = inner.ring.push(CapturedImage::new(data, now), now);
        if inner.sweeper.is_none() {
            self.start_sweeper(&mut inner);
        }
        tracing::debug!("Capture buffer holds {} image(s)", count);
        count
    }

    pub fn garbage_collect(&self) -> usize {
        let mut inner = self.lock();
        let evicted = inner.ring.garbage_collect(Instant::now());
        if inner.ring.is_empty() {
            inner.stop_sweeper();
        }
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
        inner.stop_sweeper();
    }

    /// Drains the buffer for submission.
    pub fn take(&self) -> Vec<CapturedImage> {
        let mut inner = self.lock();
        let images = inner.ring.take();
        inner.stop_sweeper();
        images
    }

    pub fn remove(&self, index: usize) -> Option<CapturedImage> {
        let mut inner = self.lock();
        let removed = inner.ring.remove(index);
        if inner.ring.is_empty() {
            inner.stop_sweeper();
        }
        removed
    }

    /// Drops images once their submission went through. Anything pushed
    /// in the meantime stays.
    pub fn discard(&self, submitted: &[CapturedImage]) -> usize {
        let mut inner = self.lock();
        let removed = inner.ring.discard(submitted);
        if inner.ring.is_empty() {
            inner.stop_sweeper();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<CapturedImage> {
        self.lock().ring.snapshot()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    pub fn sweeper_running(&self) -> bool {
        self.lock().sweeper.is_some()
    }

    fn start_sweeper(&self, inner: &mut Inner) {
        let Some(ttl) = inner.ring.ttl() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime, capture buffer relies on push-time eviction");
            return;
        };

        let token = CancellationToken::new();
        inner.sweeper = Some(token.clone());
        let weak = Arc::downgrade(&self.inner);
        let cadence = (ttl / 3).max(Duration::from_millis(1));
        handle.spawn(sweep(weak, token, cadence));
    }
}

async fn sweep(inner: Weak<Mutex<Inner>>, token: CancellationToken, cadence: Duration) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(cadence) => {}
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let mut guard = strong.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return;
        }
        let evicted = guard.ring.garbage_collect(Instant::now());
        if evicted > 0 {
            tracing::debug!("Evicted {} expired image(s)", evicted);
        }
        if guard.ring.is_empty() {
            guard.stop_sweeper();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(15);

    fn image(tag: &str, at: Instant) -> CapturedImage {
        CapturedImage::new(format!("data:image/jpeg;base64,{}", tag), at)
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_push_drops_oldest() {
        let t0 = Instant::now();
        let mut ring = ImageRing::new(4, Some(TTL));
        for (i, tag) in ["a", "b", "c", "d"].iter().enumerate() {
            assert_eq!(ring.push(image(tag, t0), t0), i + 1);
        }
        assert_eq!(ring.push(image("e", t0), t0), 4);

        let tags: Vec<String> = ring.snapshot().into_iter().map(|i| i.data).collect();
        assert!(tags[0].ends_with(",b"));
        assert!(tags[3].ends_with(",e"));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_at_ttl_plus_one_keeps_order() {
        let t0 = Instant::now();
        let mut ring = ImageRing::new(4, Some(TTL));
        for (i, tag) in ["a", "b", "c", "d"].iter().enumerate() {
            let at = t0 + Duration::from_secs(i as u64);
            ring.push(image(tag, at), at);
        }

        let evicted = ring.garbage_collect(t0 + TTL + Duration::from_secs(1));
        assert_eq!(evicted, 1);
        let survivors: Vec<String> = ring.snapshot().into_iter().map(|i| i.data).collect();
        assert_eq!(survivors.len(), 3);
        assert!(survivors[0].ends_with(",b"));
        assert!(survivors[2].ends_with(",d"));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_is_idempotent() {
        let t0 = Instant::now();
        let mut ring = ImageRing::new(4, Some(TTL));
        ring.push(image("a", t0), t0);
        ring.push(image("b", t0 + Duration::from_secs(10)), t0 + Duration::from_secs(10));

        let later = t0 + Duration::from_secs(20);
        assert_eq!(ring.garbage_collect(later), 1);
        let after_first = ring.snapshot();
        assert_eq!(ring.garbage_collect(later), 0);
        assert_eq!(ring.snapshot(), after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn image_exactly_ttl_old_survives() {
        let t0 = Instant::now();
        let mut ring = ImageRing::new(4, Some(TTL));
        ring.push(image("a", t0), t0);
        assert_eq!(ring.garbage_collect(t0 + TTL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_ttl_never_expires() {
        let t0 = Instant::now();
        let mut ring = ImageRing::new(4, None);
        ring.push(image("a", t0), t0);
        assert_eq!(ring.garbage_collect(t0 + Duration::from_secs(3600)), 0);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_empties_buffer_and_stops() {
        let buffer = CaptureBuffer::new(4, Some(Duration::from_secs(3)));
        assert!(!buffer.sweeper_running());

        buffer.push("data:image/jpeg;base64,a");
        assert!(buffer.sweeper_running());

        // Sweeps at 1s, 2s, 3s keep the image; the one at 4s evicts it.
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert!(buffer.is_empty());
        assert!(!buffer.sweeper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_and_take_stop_the_sweeper() {
        let buffer = CaptureBuffer::new(4, Some(TTL));
        buffer.push("data:image/jpeg;base64,a");
        buffer.clear();
        assert!(!buffer.sweeper_running());

        buffer.push("data:image/jpeg;base64,b");
        buffer.push("data:image/jpeg;base64,c");
        assert!(buffer.sweeper_running());
        let taken = buffer.take();
        assert_eq!(taken.len(), 2);
        assert!(buffer.is_empty());
        assert!(!buffer.sweeper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn discard_keeps_images_pushed_after_the_snapshot() {
        let buffer = CaptureBuffer::new(4, Some(TTL));
        buffer.push("data:image/jpeg;base64,a");
        buffer.push("data:image/jpeg;base64,b");
        let submitted = buffer.snapshot();

        tokio::time::advance(Duration::from_millis(10)).await;
        buffer.push("data:image/jpeg;base64,c");

        assert_eq!(buffer.discard(&submitted), 2);
        let left: Vec<String> = buffer.snapshot().into_iter().map(|i| i.data).collect();
        assert_eq!(left, vec!["data:image/jpeg;base64,c".to_string()]);
        assert!(buffer.sweeper_running());

        assert_eq!(buffer.discard(&buffer.snapshot()), 1);
        assert!(!buffer.sweeper_running());
    }

    #[test]
    fn buffer_without_runtime_still_bounds_size() {
        let buffer = CaptureBuffer::new(2, Some(TTL));
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.push("c"), 2);
        assert!(!buffer.sweeper_running());
        assert_eq!(buffer.remove(0).unwrap().data, "b");
    }
}
