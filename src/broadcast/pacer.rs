//! Per-canvas render loop with idle backoff.
//!
//! While the canvas is being drawn on, a snapshot is rendered and pushed
//! every `frame_interval`. Once the mutation counter has stood still for
//! `idle_after`, the loop parks until the canvas changes, a new viewer
//! subscribes, or `idle_ceiling` passes, then resumes fast ticking.
//! Pushed frames are bare encoded images; viewers add their own framing.

use super::hub::BroadcastHub;
use crate::canvas::CanvasGrid;
use crate::render::Renderer;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Pacing intervals.
#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub frame_interval: Duration,
    pub idle_after: Duration,
    pub idle_ceiling: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(25),
            idle_after: Duration::from_millis(50),
            idle_ceiling: Duration::from_secs(25),
        }
    }
}

/// Renders one canvas into one hub.
pub struct Pacer {
    canvas: Arc<CanvasGrid>,
    hub: Arc<BroadcastHub>,
    renderer: Arc<dyn Renderer>,
    config: PacerConfig,
}

impl Pacer {
    pub fn new(
        canvas: Arc<CanvasGrid>,
        hub: Arc<BroadcastHub>,
        renderer: Arc<dyn Renderer>,
        config: PacerConfig,
    ) -> Self {
        Self {
            canvas,
            hub,
            renderer,
            config,
        }
    }

    /// Run forever.
    pub async fn run(self) {
        let mut ticker = interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut image = Vec::new();
        let mut last_seen = self.canvas.mutations();
        let mut last_change = Instant::now();

        debug!(
            grid = self.canvas.id(),
            hub = self.hub.name(),
            interval_ms = self.config.frame_interval.as_millis() as u64,
            "Pacer started"
        );

        loop {
            ticker.tick().await;

            // Armed before the emptiness check so a viewer joining after it
            // still wakes an idle wait.
            let joined = self.hub.subscriber_joined();
            tokio::pin!(joined);
            joined.as_mut().enable();

            let seen = self.canvas.mutations();
            if seen != last_seen {
                last_seen = seen;
                last_change = Instant::now();
            }

            if !self.hub.is_empty() {
                self.push_frame(&mut image);
            }

            if last_change.elapsed() >= self.config.idle_after {
                self.idle(joined).await;
                last_change = Instant::now();
                ticker.reset();
            }
        }
    }

    fn push_frame(&self, image: &mut Vec<u8>) {
        image.clear();
        if let Err(e) = self.renderer.render(self.canvas.as_ref(), image) {
            warn!(grid = self.canvas.id(), error = %e, "Failed to render frame");
            return;
        }
        let delivered = self.hub.push(Bytes::copy_from_slice(image));
        trace!(grid = self.canvas.id(), delivered, bytes = image.len(), "Pushed frame");
    }

    async fn idle(&self, joined: Pin<&mut Notified<'_>>) {
        trace!(grid = self.canvas.id(), "Canvas idle, backing off");
        let reason = tokio::select! {
            _ = self.canvas.changed() => "change",
            _ = joined => "subscriber",
            _ = tokio::time::sleep(self.config.idle_ceiling) => "ceiling",
        };
        trace!(grid = self.canvas.id(), reason, "Pacer resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubConfig;
    use crate::canvas::Fill;
    use crate::color::Color;
    use crate::render::RgbRenderer;
    use std::convert::identity;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    async fn drain(rx: &mut DuplexStream) -> usize {
        let mut total = 0;
        let mut buf = [0u8; 4096];
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(50), rx.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    fn pacer(canvas: &Arc<CanvasGrid>, hub: &Arc<BroadcastHub>, idle_ceiling: Duration) -> Pacer {
        Pacer::new(
            Arc::clone(canvas),
            Arc::clone(hub),
            Arc::new(RgbRenderer),
            PacerConfig {
                frame_interval: Duration::from_millis(10),
                idle_after: Duration::from_millis(30),
                idle_ceiling,
            },
        )
    }

    #[tokio::test]
    async fn test_pacer_backs_off_and_wakes_on_change() {
        let canvas = Arc::new(CanvasGrid::new(0, 2, 2, Fill::Solid(Color::BLACK)));
        let hub = BroadcastHub::new("grid", HubConfig::default());
        let (tx, mut rx) = duplex(1 << 16);
        hub.add_subscriber(tx, identity);

        let task = tokio::spawn(pacer(&canvas, &hub, Duration::from_secs(30)).run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = drain(&mut rx).await;
        assert!(first > 0, "no frames before going idle");

        // Idle: nothing more arrives.
        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(150), rx.read(&mut buf)).await;
        assert!(quiet.is_err(), "pacer kept rendering while idle");

        canvas.set_exact(0, 0, Color::rgb(1, 2, 3)).unwrap();
        let woke = tokio::time::timeout(Duration::from_millis(500), rx.read(&mut buf)).await;
        assert!(matches!(woke, Ok(Ok(n)) if n > 0));

        task.abort();
    }

    #[tokio::test]
    async fn test_pacer_wakes_when_subscriber_joins() {
        let canvas = Arc::new(CanvasGrid::new(0, 2, 2, Fill::Solid(Color::BLACK)));
        let hub = BroadcastHub::new("grid", HubConfig::default());
        let task = tokio::spawn(pacer(&canvas, &hub, Duration::from_secs(30)).run());

        // No mutations and no viewers: the pacer parks.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (tx, mut rx) = duplex(1 << 16);
        hub.add_subscriber(tx, identity);
        let mut buf = [0u8; 12];
        tokio::time::timeout(Duration::from_millis(500), rx.read_exact(&mut buf))
            .await
            .expect("new subscriber waited for the idle ceiling")
            .unwrap();
        assert_eq!(buf, [0u8; 12]);

        task.abort();
    }

    #[tokio::test]
    async fn test_pacer_sends_keepalive_at_ceiling() {
        let canvas = Arc::new(CanvasGrid::new(0, 1, 1, Fill::Solid(Color::BLACK)));
        let hub = BroadcastHub::new("grid", HubConfig::default());
        let (tx, mut rx) = duplex(1 << 16);
        hub.add_subscriber(tx, identity);

        let task = tokio::spawn(pacer(&canvas, &hub, Duration::from_millis(200)).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).await > 0);

        // Parked with no changes and no new viewers, yet frames resume.
        let mut buf = [0u8; 3];
        tokio::time::timeout(Duration::from_millis(600), rx.read_exact(&mut buf))
            .await
            .expect("no keep-alive frame at the idle ceiling")
            .unwrap();
        assert_eq!(canvas.mutations(), 0);

        task.abort();
    }

    #[tokio::test]
    async fn test_pacer_pushes_rendered_image() {
        let canvas = Arc::new(CanvasGrid::new(0, 1, 1, Fill::Solid(Color::rgb(9, 8, 7))));
        let hub = BroadcastHub::new("grid", HubConfig::default());
        let mut feed = hub.subscribe();

        let task = tokio::spawn(
            Pacer::new(canvas, Arc::clone(&hub), Arc::new(RgbRenderer), PacerConfig::default()).run(),
        );

        let frame = tokio::time::timeout(Duration::from_secs(1), feed.frames.recv())
            .await
            .expect("frame")
            .unwrap();
        assert_eq!(&frame[..], &[9, 8, 7]);

        task.abort();
    }
}
