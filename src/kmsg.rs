use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::MakeWriter;

pub const KMSG_PATH: &str = "/dev/kmsg";

/// Log sink for the kernel ring buffer.
///
/// Each formatted event becomes one kmsg record. When the device cannot be
/// opened the output goes to stderr instead.
#[derive(Debug, Clone)]
pub struct KmsgWriter {
    path: PathBuf,
    tag: String,
}

impl KmsgWriter {
    pub fn new(path: impl AsRef<Path>, tag: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            tag: tag.into(),
        }
    }

    fn open(&self) -> KmsgSink<'_> {
        match OpenOptions::new().write(true).append(true).open(&self.path) {
            Ok(file) => KmsgSink::Kmsg { file, tag: &self.tag },
            Err(_) => KmsgSink::Stderr(io::stderr()),
        }
    }
}

impl Default for KmsgWriter {
    fn default() -> Self {
        Self::new(KMSG_PATH, env!("CARGO_PKG_NAME"))
    }
}

impl<'a> MakeWriter<'a> for KmsgWriter {
    type Writer = KmsgSink<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.open()
    }
}

pub enum KmsgSink<'a> {
    Kmsg { file: File, tag: &'a str },
    Stderr(io::Stderr),
}

impl Write for KmsgSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            KmsgSink::Kmsg { file, tag } => {
                // One write per record, tag included.
                let mut record = Vec::with_capacity(tag.len() + 2 + buf.len());
                record.extend_from_slice(tag.as_bytes());
                record.extend_from_slice(b": ");
                record.extend_from_slice(buf);
                file.write_all(&record)?;
                Ok(buf.len())
            }
            KmsgSink::Stderr(stderr) => stderr.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            KmsgSink::Kmsg { file, .. } => file.flush(),
            KmsgSink::Stderr(stderr) => stderr.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn records_are_tagged() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("kmsg");
        fs::write(&path, b"").unwrap();

        let writer = KmsgWriter::new(&path, "bootui");
        writer.make_writer().write_all(b"hello\n").unwrap();
        writer.make_writer().write_all(b"again\n").unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "bootui: hello\nbootui: again\n"
        );
    }

    #[test]
    fn falls_back_to_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let writer = KmsgWriter::new(temp.path().join("missing"), "bootui");
        assert!(matches!(writer.make_writer(), KmsgSink::Stderr(_)));
    }
}
