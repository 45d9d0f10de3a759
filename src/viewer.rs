//! HTTP and WebSocket front for the broadcast hubs.
//!
//! Routes:
//! - `GET /grid`: the main canvas as a `multipart/x-mixed-replace` JPEG stream
//! - `GET /icon`: one JPEG snapshot of the icon canvas
//! - `/icoflut`: WebSocket, one binary message per icon frame
//! - `/stats`: WebSocket, one JSON text message per stats interval

use crate::broadcast::{BroadcastHub, Feed, FRAME_BOUNDARY};
use crate::canvas::CanvasGrid;
use crate::render::{multipart_part, Renderer};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

/// Bytes buffered between a stream subscriber and its HTTP body.
const STREAM_BUFFER: usize = 256 * 1024;

/// Everything the viewer routes serve from.
pub struct Viewer {
    pub grid: Arc<BroadcastHub>,
    pub icon: Arc<BroadcastHub>,
    pub stats: Arc<BroadcastHub>,
    pub icon_canvas: Arc<CanvasGrid>,
    /// Encodes grid frames; only its content type is needed here.
    pub grid_renderer: Arc<dyn Renderer>,
    pub icon_renderer: Arc<dyn Renderer>,
    pub write_timeout: Duration,
}

impl Viewer {
    /// Stream every grid frame pushed from now on as a multipart part.
    fn grid_stream(&self) -> warp::reply::Response {
        let (writer, reader) = tokio::io::duplex(STREAM_BUFFER);
        let content_type = self.grid_renderer.content_type();
        // The delivery task ends on its first write after the body is dropped.
        let sub = self.grid.add_subscriber(writer, move |frame: Bytes| {
            multipart_part(FRAME_BOUNDARY, content_type, &frame)
        });
        debug!(hub = self.grid.name(), id = ?sub.id, "Stream viewer subscribed");

        let body = Body::wrap_stream(ReaderStream::new(reader));
        warp::reply::with_header(
            warp::reply::with_header(
                warp::reply::with_header(
                    warp::reply::Response::new(body),
                    "content-type",
                    format!("multipart/x-mixed-replace;boundary={}", FRAME_BOUNDARY),
                ),
                "cache-control",
                "no-store",
            ),
            "connection",
            "close",
        )
        .into_response()
    }

    fn icon_snapshot(&self) -> warp::reply::Response {
        let mut image = Vec::new();
        if let Err(e) = self.icon_renderer.render(self.icon_canvas.as_ref(), &mut image) {
            warn!(error = %e, "Failed to render icon");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        warp::reply::with_header(
            warp::reply::with_header(
                warp::reply::Response::new(Body::from(image)),
                "content-type",
                self.icon_renderer.content_type(),
            ),
            "cache-control",
            "no-store",
        )
        .into_response()
    }
}

/// All viewer routes.
pub fn routes(
    viewer: Arc<Viewer>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_viewer = warp::any().map(move || Arc::clone(&viewer));

    let grid = warp::path("grid")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_viewer.clone())
        .map(|viewer: Arc<Viewer>| viewer.grid_stream());

    let icon = warp::path("icon")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_viewer.clone())
        .map(|viewer: Arc<Viewer>| viewer.icon_snapshot());

    let icoflut = warp::path("icoflut")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_viewer.clone())
        .map(|ws: Ws, viewer: Arc<Viewer>| {
            ws.on_upgrade(move |socket| async move {
                let feed = viewer.icon.subscribe();
                pump(socket, &viewer.icon, feed, viewer.write_timeout, |frame| {
                    Message::binary(frame.to_vec())
                })
                .await
            })
        });

    let stats = warp::path("stats")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_viewer)
        .map(|ws: Ws, viewer: Arc<Viewer>| {
            ws.on_upgrade(move |socket| async move {
                let feed = viewer.stats.subscribe();
                pump(socket, &viewer.stats, feed, viewer.write_timeout, |frame| {
                    Message::text(String::from_utf8_lossy(&frame).into_owned())
                })
                .await
            })
        });

    grid.or(icon).or(icoflut).or(stats)
}

/// Bind the viewer routes to `addr`. Returns the bound address and the
/// server future.
pub fn bind(
    addr: SocketAddr,
    viewer: Viewer,
) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static), warp::Error> {
    warp::serve(routes(Arc::new(viewer))).try_bind_ephemeral(addr)
}

/// Forward hub frames to a WebSocket until either side stops.
async fn pump<F>(
    socket: WebSocket,
    hub: &BroadcastHub,
    feed: Feed,
    write_timeout: Duration,
    to_message: F,
) where
    F: Fn(Bytes) -> Message,
{
    let Feed { id, mut frames } = feed;
    let (mut tx, mut rx) = socket.split();
    debug!(hub = hub.name(), "WebSocket viewer subscribed");

    let reason = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break "removed";
                };
                match tokio::time::timeout(write_timeout, tx.send(to_message(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break "send failed",
                    Err(_) => break "send timed out",
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(msg)) if msg.is_close() => break "closed",
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break "disconnected",
            },
        }
    };

    hub.remove_subscriber(id);
    let _ = tx.close().await;
    debug!(hub = hub.name(), reason, "WebSocket viewer left");
}
