//! Block reader for one raw PCM source

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::pump::PipelineListener;
use crate::store::{ChannelBufferStore, StoreError};
use crate::types::{Sample, SourceBinding, CHANNELS_PER_SOURCE, SAMPLE_BYTES};

use super::{SourceError, SourceResult};

/// How a reader thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEnd {
    /// Short read: the source ran out of complete blocks
    EndOfSource,
    /// The store was shut down while the reader was waiting
    Shutdown,
}

/// Outcome of a finished reader thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSummary {
    pub index: usize,
    /// Complete blocks deposited into the store
    pub blocks: u64,
    pub end: SourceEnd,
}

/// Reads one interleaved stereo source and feeds its channel pair
pub struct PcmSourceReader<R> {
    index: usize,
    binding: SourceBinding,
    input: R,
    store: Arc<ChannelBufferStore>,
    listener: Arc<dyn PipelineListener>,
    /// Raw little-endian bytes of one block
    bytes: Vec<u8>,
    /// Decoded interleaved frames of one block
    frames: Vec<Sample>,
}

impl PcmSourceReader<BufReader<File>> {
    /// Open a raw PCM file as source `index`
    pub fn open(
        index: usize,
        path: &Path,
        store: Arc<ChannelBufferStore>,
        listener: Arc<dyn PipelineListener>,
    ) -> SourceResult<Self> {
        let file = File::open(path).map_err(|e| SourceError::OpenFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        log::info!("Source {}: opened {}", index, path.display());
        Self::new(index, BufReader::new(file), store, listener)
    }
}

impl<R: Read> PcmSourceReader<R> {
    /// Wrap any byte stream as source `index`
    pub fn new(
        index: usize,
        input: R,
        store: Arc<ChannelBufferStore>,
        listener: Arc<dyn PipelineListener>,
    ) -> SourceResult<Self> {
        let binding = store.binding(index).ok_or(SourceError::Store {
            index,
            error: StoreError::SourceOutOfRange {
                index,
                sources: store.source_count(),
            },
        })?;
        let samples = store.block_size() * CHANNELS_PER_SOURCE;

        Ok(Self {
            index,
            binding,
            input,
            store,
            listener,
            bytes: vec![0; samples * SAMPLE_BYTES],
            frames: vec![0; samples],
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Read exactly one block. Returns `false` on a short read.
    fn read_block(&mut self) -> SourceResult<bool> {
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.input.read(&mut self.bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(SourceError::Read {
                        index: self.index,
                        error,
                    })
                }
            }
        }

        if filled < self.bytes.len() {
            if filled > 0 {
                log::debug!(
                    "Source {}: dropping partial block ({} of {} bytes)",
                    self.index,
                    filled,
                    self.bytes.len()
                );
            }
            return Ok(false);
        }

        for (dst, raw) in self
            .frames
            .iter_mut()
            .zip(self.bytes.chunks_exact(SAMPLE_BYTES))
        {
            *dst = Sample::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(true)
    }

    /// Reader loop: read a block, deposit it, repeat until end of source
    pub fn run(mut self) -> SourceResult<SourceSummary> {
        log::info!("Source {} feeding {}", self.index, self.binding);
        let mut blocks = 0u64;

        let end = loop {
            match self.read_block() {
                Ok(true) => {}
                Ok(false) => break SourceEnd::EndOfSource,
                Err(e) => {
                    log::error!("{}", e);
                    self.finish(blocks);
                    return Err(e);
                }
            }

            match self.store.mark_ready(self.index, &self.frames) {
                Ok(_) => blocks += 1,
                Err(StoreError::Shutdown) => break SourceEnd::Shutdown,
                Err(error) => {
                    return Err(SourceError::Store {
                        index: self.index,
                        error,
                    })
                }
            }
        };

        match end {
            SourceEnd::EndOfSource => {
                log::info!("Source {}: end of source after {} blocks", self.index, blocks);
                self.finish(blocks);
            }
            SourceEnd::Shutdown => {
                log::debug!("Source {}: stopped by shutdown after {} blocks", self.index, blocks);
            }
        }

        Ok(SourceSummary {
            index: self.index,
            blocks,
            end,
        })
    }

    fn finish(&self, blocks: u64) {
        if let Err(e) = self.store.mark_finished(self.index) {
            log::warn!("Source {}: could not mark finished: {}", self.index, e);
        }
        self.listener.source_finished(self.index, blocks);
    }
}

/// Run a reader on its own named thread
pub fn spawn_reader<R>(
    reader: PcmSourceReader<R>,
) -> SourceResult<JoinHandle<SourceResult<SourceSummary>>>
where
    R: Read + Send + 'static,
{
    let name = format!("pcm-source-{}", reader.index());
    let handle = thread::Builder::new().name(name).spawn(move || reader.run())?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{ChannelListener, PipelineEvent};
    use crate::store::EndOfSourcePolicy;
    use std::io::Cursor;

    fn encode(samples: &[Sample]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn single_store(block: usize) -> Arc<ChannelBufferStore> {
        Arc::new(
            ChannelBufferStore::new(block, vec![SourceBinding::sequential(0)], EndOfSourcePolicy::Halt)
                .unwrap(),
        )
    }

    /// Reads that return one byte at a time
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let end = buf.len().min(1);
            self.0.read(&mut buf[..end])
        }
    }

    #[test]
    fn test_reads_one_block_and_drops_partial_tail() {
        let store = single_store(2);
        let (listener, events) = ChannelListener::new();
        let listener: Arc<dyn PipelineListener> = Arc::new(listener);

        // One full block (2 frames) plus half a frame
        let mut bytes = encode(&[1, -1, 2, -2]);
        bytes.extend(encode(&[3]));

        let reader = PcmSourceReader::new(0, Cursor::new(bytes), store.clone(), listener).unwrap();
        let summary = reader.run().unwrap();

        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.end, SourceEnd::EndOfSource);
        assert!(store.is_finished(0).unwrap());
        assert_eq!(store.versions().unwrap(), vec![1, 1]);

        let mut out = vec![vec![0; 2]; 2];
        store.take_block(&mut out).unwrap();
        assert_eq!(out, vec![vec![1, 2], vec![-1, -2]]);

        assert_eq!(
            events.try_recv().unwrap(),
            PipelineEvent::SourceFinished { index: 0, blocks: 1 }
        );
    }

    #[test]
    fn test_assembles_block_from_fragmented_reads() {
        let store = single_store(2);
        let listener: Arc<dyn PipelineListener> = Arc::new(crate::pump::LogListener);
        let input = Trickle(Cursor::new(encode(&[7, 8, 9, 10])));

        let summary = PcmSourceReader::new(0, input, store.clone(), listener)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.blocks, 1);

        let mut out = vec![vec![0; 2]; 2];
        store.take_block(&mut out).unwrap();
        assert_eq!(out, vec![vec![7, 9], vec![8, 10]]);
    }

    #[test]
    fn test_empty_source_never_marks_ready() {
        let store = single_store(4);
        let listener: Arc<dyn PipelineListener> = Arc::new(crate::pump::LogListener);
        let reader = PcmSourceReader::new(0, Cursor::new(Vec::new()), store.clone(), listener).unwrap();

        let summary = reader.run().unwrap();
        assert_eq!(summary.blocks, 0);
        assert_eq!(store.ready_flags().unwrap(), vec![false, false]);
        assert!(store.is_finished(0).unwrap());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let store = single_store(4);
        let listener: Arc<dyn PipelineListener> = Arc::new(crate::pump::LogListener);
        let result = PcmSourceReader::open(0, Path::new("/nonexistent/in.pcm"), store, listener);
        assert!(matches!(result, Err(SourceError::OpenFailed { .. })));
    }
}
