//! On-disk framing for `.cst` segments: an Arrow IPC file whose schema must
//! match [`super::schema`] column for column.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use basalt_transport::arrow2::{
    datatypes::Schema,
    io::ipc::{
        read::{read_batch, read_file_dictionaries, read_file_metadata, Dictionaries, FileMetadata},
        write::{FileWriter, WriteOptions},
    },
};
use basalt_transport::SegmentChunk;
use tracing::{trace, warn};

use super::SEGMENT_EXTENSION;
use crate::error::{Error, Result};

/// Totals for a committed segment file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Committed {
    pub rows: usize,
    pub batches: usize,
    pub bytes: u64,
}

/// Streams batches into `<dest>.tmp`. Nothing is visible at `dest` until
/// [`SegmentFileWriter::commit`] renames the finished file into place; a
/// writer dropped before that removes its temporary file.
pub(super) struct SegmentFileWriter {
    ipc: Option<FileWriter<fs::File>>,
    tmp: PathBuf,
    dest: PathBuf,
    rows: usize,
    batches: usize,
}

impl SegmentFileWriter {
    pub(super) fn begin(dest: &Path, schema: &Schema) -> Result<Self> {
        let tmp = dest.with_extension(format!("{SEGMENT_EXTENSION}.tmp"));
        let file = fs::File::create(&tmp)?;
        let ipc = FileWriter::try_new(file, schema.clone(), None, WriteOptions { compression: None })?;
        Ok(Self {
            ipc: Some(ipc),
            tmp,
            dest: dest.to_path_buf(),
            rows: 0,
            batches: 0,
        })
    }

    /// Empty batches are dropped so every block in the file carries rows.
    pub(super) fn append(&mut self, batch: SegmentChunk) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ipc = self
            .ipc
            .as_mut()
            .ok_or_else(|| Error::IllegalState(format!("{:?} already committed", self.dest)))?;
        self.rows += batch.len();
        self.batches += 1;
        ipc.write(&batch, None)?;
        Ok(())
    }

    /// Write the footer, fsync, and rename over `dest`.
    pub(super) fn commit(mut self) -> Result<Committed> {
        let mut ipc = self
            .ipc
            .take()
            .ok_or_else(|| Error::IllegalState(format!("{:?} already committed", self.dest)))?;
        ipc.finish()?;
        ipc.into_inner().sync_all()?;
        fs::rename(&self.tmp, &self.dest)?;

        let committed = Committed {
            rows: self.rows,
            batches: self.batches,
            bytes: fs::metadata(&self.dest)?.len(),
        };
        trace!("committed {:?}: {committed:?}", self.dest);
        Ok(committed)
    }
}

impl Drop for SegmentFileWriter {
    fn drop(&mut self) {
        if self.ipc.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp) {
                warn!("failed to remove abandoned {:?}: {e}", self.tmp);
            }
        }
    }
}

/// Reads the blocks of a committed segment in file order.
pub(super) struct SegmentFileReader {
    file: fs::File,
    footer: FileMetadata,
    dictionaries: Dictionaries,
    message_scratch: Vec<u8>,
    data_scratch: Vec<u8>,
    remaining: Range<usize>,
}

impl SegmentFileReader {
    /// Open `path`, rejecting files whose columns differ from `expected`.
    pub(super) fn open(path: &Path, expected: &Schema) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let footer = read_file_metadata(&mut file)?;

        let found = &footer.schema.fields;
        let matches = found.len() == expected.fields.len()
            && found
                .iter()
                .zip(&expected.fields)
                .all(|(f, e)| f.name == e.name && f.data_type == e.data_type);
        if !matches {
            let names: Vec<_> = found.iter().map(|f| f.name.as_str()).collect();
            return Err(Error::IllegalState(format!(
                "{path:?} is not a segment (columns {names:?})"
            )));
        }

        let mut data_scratch = vec![];
        let dictionaries = read_file_dictionaries(&mut file, &footer, &mut data_scratch)?;
        Ok(Self {
            remaining: 0..footer.blocks.len(),
            file,
            footer,
            dictionaries,
            message_scratch: vec![],
            data_scratch,
        })
    }

    pub(super) fn batch_count(&self) -> usize {
        self.footer.blocks.len()
    }

    fn batch(&mut self, block: usize) -> Result<SegmentChunk> {
        Ok(read_batch(
            &mut self.file,
            &self.dictionaries,
            &self.footer,
            None,
            None,
            block,
            &mut self.message_scratch,
            &mut self.data_scratch,
        )?)
    }
}

impl Iterator for SegmentFileReader {
    type Item = Result<SegmentChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.remaining.next()?;
        Some(self.batch(block))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.remaining.size_hint()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use basalt_transport::arrow2::array::{Array, PrimitiveArray};
    use basalt_transport::arrow2::chunk::Chunk;
    use basalt_transport::arrow2::datatypes::{DataType, Field};
    use tempfile::tempdir;

    fn numbers(values: Vec<u64>) -> anyhow::Result<SegmentChunk> {
        Ok(Chunk::try_new(vec![PrimitiveArray::<u64>::from_vec(values).boxed()])?)
    }

    fn single_column() -> Schema {
        Schema::from(vec![Field::new("v", DataType::UInt64, false)])
    }

    #[test]
    fn commit_counts_rows_and_skips_empty_batches() -> anyhow::Result<()> {
        let root = tempdir()?;
        let dest = root.path().join("a.cst");
        let schema = single_column();

        let mut writer = SegmentFileWriter::begin(&dest, &schema)?;
        writer.append(numbers(vec![1, 2, 3])?)?;
        writer.append(numbers(vec![])?)?;
        writer.append(numbers(vec![4])?)?;
        assert!(!dest.exists());

        let committed = writer.commit()?;
        assert_eq!(committed.rows, 4);
        assert_eq!(committed.batches, 2);
        assert_eq!(committed.bytes, fs::metadata(&dest)?.len());
        assert!(!root.path().join("a.cst.tmp").exists());

        let reader = SegmentFileReader::open(&dest, &schema)?;
        assert_eq!(reader.batch_count(), 2);
        let lens = reader.map(|b| b.map(|c| c.len())).collect::<Result<Vec<_>>>()?;
        assert_eq!(lens, vec![3, 1]);
        Ok(())
    }

    #[test]
    fn abandoned_writer_leaves_nothing_behind() -> anyhow::Result<()> {
        let root = tempdir()?;
        let dest = root.path().join("b.cst");

        let mut writer = SegmentFileWriter::begin(&dest, &single_column())?;
        writer.append(numbers(vec![1])?)?;
        drop(writer);

        assert_eq!(fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn foreign_columns_are_rejected() -> anyhow::Result<()> {
        let root = tempdir()?;
        let dest = root.path().join("c.cst");

        let mut writer = SegmentFileWriter::begin(&dest, &single_column())?;
        writer.append(numbers(vec![1])?)?;
        writer.commit()?;

        assert!(matches!(
            SegmentFileReader::open(&dest, &super::super::schema()),
            Err(Error::IllegalState(_))
        ));
        Ok(())
    }

    #[test]
    fn truncated_file_is_an_error() -> anyhow::Result<()> {
        let root = tempdir()?;
        let dest = root.path().join("d.cst");
        let schema = single_column();

        let mut writer = SegmentFileWriter::begin(&dest, &schema)?;
        writer.append(numbers(vec![1, 2, 3])?)?;
        writer.commit()?;

        let len = fs::metadata(&dest)?.len();
        fs::File::options().write(true).open(&dest)?.set_len(len - 10)?;

        assert!(SegmentFileReader::open(&dest, &schema).is_err());
        Ok(())
    }
}
