use std::io::{self, Write};

/// How a status or diagnostic line ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStatus {
    /// Line written and flushed.
    Written,
    /// Reader went away; the broker's outcome is unaffected.
    BrokenPipe,
}

/// Writes `text` plus a newline to `writer` in one flushed line.
fn write_line<W: Write>(writer: &mut W, text: &str) -> io::Result<OutputStatus> {
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(b'\n');
    match writer.write_all(&line).and_then(|()| writer.flush()) {
        Ok(()) => Ok(OutputStatus::Written),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(OutputStatus::BrokenPipe),
        Err(error) => Err(error),
    }
}

/// Prints one status line to stdout. A closed pipe is not an error.
pub(crate) fn status_line(text: &str) -> io::Result<()> {
    if write_line(&mut io::stdout().lock(), text)? == OutputStatus::BrokenPipe {
        tracing::debug!("stdout closed before status line");
    }
    Ok(())
}

/// Writes one diagnostic line to stderr, ignoring a closed stream.
pub fn stderr_line(text: &str) {
    let _ = write_line(&mut io::stderr().lock(), text);
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};

    use super::{write_line, OutputStatus};

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn line_is_newline_terminated() {
        let mut buffer = Vec::new();
        assert_eq!(
            write_line(&mut buffer, "mounted 2 secret(s)").unwrap(),
            OutputStatus::Written
        );
        assert_eq!(buffer, b"mounted 2 secret(s)\n");
    }

    #[test]
    fn closed_reader_is_not_an_error() {
        assert_eq!(
            write_line(&mut ClosedPipe, "not mounted").unwrap(),
            OutputStatus::BrokenPipe
        );
    }
}
