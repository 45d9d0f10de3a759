//! Shared pixel canvases.
//!
//! Each canvas is a fixed-size, row-major array of atomic packed colors.
//! Every access is a single word load or store, so any number of connection
//! tasks can read and write concurrently without a canvas-wide lock:
//! - `set_exact` is a plain store
//! - `set` blends with a compare-and-swap loop, so two racing blends on one
//!   cell always land in some sequential order
//! - the mutation counter is a relaxed atomic increment

use crate::color::{encode_hex_color, Color};
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Grid ids are the low nibble of a binary opcode byte.
pub const MAX_GRIDS: usize = 16;

/// Canvas access errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },

    #[error("grid {0} does not exist")]
    UnknownGrid(u8),

    #[error("at most {MAX_GRIDS} grids are supported")]
    GridLimit,
}

/// Initial contents of a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Solid(Color),
    Random,
}

impl std::fmt::Display for Fill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fill::Solid(color) => write!(f, "solid #{}", encode_hex_color(*color)),
            Fill::Random => f.write_str("random"),
        }
    }
}

/// A fixed-size canvas shared between connections.
pub struct CanvasGrid {
    id: u8,
    width: u16,
    height: u16,
    cells: Box<[AtomicU32]>,
    mutations: AtomicU64,
    /// Milliseconds since the Unix epoch.
    modified_ms: AtomicI64,
    changed: Notify,
}

impl CanvasGrid {
    pub fn new(id: u8, width: u16, height: u16, fill: Fill) -> Self {
        let len = width as usize * height as usize;
        let cells: Box<[AtomicU32]> = match fill {
            Fill::Solid(color) => (0..len).map(|_| AtomicU32::new(color.packed())).collect(),
            Fill::Random => {
                let mut rng = rand::thread_rng();
                (0..len)
                    .map(|_| AtomicU32::new(Color::from_packed(rng.gen()).opaque().packed()))
                    .collect()
            }
        };

        Self {
            id,
            width,
            height,
            cells,
            mutations: AtomicU64::new(0),
            modified_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Number of writes applied so far. Only ever grows.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        let ms = self.modified_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    /// Resolves after the next write to this canvas.
    ///
    /// A write that happened while nobody was waiting is remembered, so the
    /// next call returns immediately.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    fn index(&self, x: u16, y: u16) -> Result<usize, CanvasError> {
        if x >= self.width || y >= self.height {
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(y as usize * self.width as usize + x as usize)
    }

    /// Read a pixel. The result is always opaque.
    pub fn get(&self, x: u16, y: u16) -> Result<Color, CanvasError> {
        let idx = self.index(x, y)?;
        Ok(self.load(idx).opaque())
    }

    /// Blend `color` over the stored pixel using `color`'s alpha.
    pub fn set(&self, x: u16, y: u16, color: Color) -> Result<(), CanvasError> {
        let idx = self.index(x, y)?;
        match color.a() {
            0xff => self.cells[idx].store(color.packed(), Ordering::Relaxed),
            _ => {
                // The closure never returns None, so this cannot fail.
                let _ = self.cells[idx].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |stored| {
                    Some(color.over(Color::from_packed(stored)).packed())
                });
            }
        }
        self.touch();
        Ok(())
    }

    /// Overwrite a pixel verbatim, alpha included.
    pub fn set_exact(&self, x: u16, y: u16, color: Color) -> Result<(), CanvasError> {
        let idx = self.index(x, y)?;
        self.cells[idx].store(color.packed(), Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Unchecked read by linear index, used when rendering whole rows.
    pub(crate) fn load(&self, idx: usize) -> Color {
        Color::from_packed(self.cells[idx].load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.modified_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.changed.notify_one();
    }
}

impl std::fmt::Debug for CanvasGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasGrid")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mutations", &self.mutations())
            .finish()
    }
}

/// All canvases of a server, indexed by grid id.
#[derive(Debug, Default)]
pub struct Canvases {
    grids: Vec<Arc<CanvasGrid>>,
}

impl Canvases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the next canvas. Its id is the number of canvases before it.
    pub fn create(&mut self, width: u16, height: u16, fill: Fill) -> Result<Arc<CanvasGrid>, CanvasError> {
        if self.grids.len() >= MAX_GRIDS {
            return Err(CanvasError::GridLimit);
        }
        let id = self.grids.len() as u8;
        info!(grid = id, width, height, %fill, "Creating canvas");
        let grid = Arc::new(CanvasGrid::new(id, width, height, fill));
        self.grids.push(Arc::clone(&grid));
        Ok(grid)
    }

    pub fn get(&self, id: u8) -> Result<&Arc<CanvasGrid>, CanvasError> {
        self.grids
            .get(id as usize)
            .ok_or(CanvasError::UnknownGrid(id))
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CanvasGrid>> {
        self.grids.iter()
    }
}
