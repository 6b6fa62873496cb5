use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::classifier::FrameType;
use crate::tasks::Bitstream;

/// Consumer of delivered output units. Calls arrive in submission order.
pub trait Sink: Send {
    fn write_task(&mut self, bitstream: &Bitstream) -> io::Result<()>;

    /// Blocks until everything written so far is durable.
    fn wait_for_drain(&mut self) -> io::Result<()>;

    fn summary(&self) -> SinkSummary;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub units: u64,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredUnit {
    pub sequence: u64,
    pub pts: i64,
    pub frame_type: FrameType,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    units: Vec<DeliveredUnit>,
    drains: u32,
}

/// In-memory sink. Clones share the same storage, so a caller can keep a
/// handle while the pipeline owns the sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> Vec<DeliveredUnit> {
        self.state.lock().units.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.state.lock().units.iter().map(|u| u.sequence).collect()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.state.lock().units.iter().map(|u| u.pts).collect()
    }

    pub fn drain_count(&self) -> u32 {
        self.state.lock().drains
    }
}

impl Sink for MemorySink {
    fn write_task(&mut self, bitstream: &Bitstream) -> io::Result<()> {
        self.state.lock().units.push(DeliveredUnit {
            sequence: bitstream.sequence,
            pts: bitstream.pts,
            frame_type: bitstream.frame_type,
            data: bitstream.data().to_vec(),
        });
        Ok(())
    }

    fn wait_for_drain(&mut self) -> io::Result<()> {
        self.state.lock().drains += 1;
        Ok(())
    }

    fn summary(&self) -> SinkSummary {
        let state = self.state.lock();
        SinkSummary {
            units: state.units.len() as u64,
            bytes: state.units.iter().map(|u| u.data.len() as u64).sum(),
            sha256: None,
        }
    }
}

/// Appends every unit to a file and keeps a running SHA-256 of the stream.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    hasher: Sha256,
    units: u64,
    bytes: u64,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
            units: 0,
            bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write_task(&mut self, bitstream: &Bitstream) -> io::Result<()> {
        self.writer.write_all(bitstream.data())?;
        self.hasher.update(bitstream.data());
        self.units += 1;
        self.bytes += bitstream.len() as u64;
        Ok(())
    }

    fn wait_for_drain(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        debug!(path = %self.path.display(), units = self.units, bytes = self.bytes, "Output flushed");
        Ok(())
    }

    fn summary(&self) -> SinkSummary {
        SinkSummary {
            units: self.units,
            bytes: self.bytes,
            sha256: Some(format!("{:x}", self.hasher.clone().finalize())),
        }
    }
}
