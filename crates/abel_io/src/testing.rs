// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted stream doubles for the crate's tests.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};

use crate::stream::IoStream;

/// What a scripted stream does on its next `readv` call.
pub(crate) enum ReadStep {
    /// Scatter these bytes over the supplied buffers.
    Data(Vec<u8>),
    /// Report end of stream.
    Eof,
    /// Fail with this error kind.
    Fail(io::ErrorKind),
}

/// An in-memory stream driven by a script of read steps, with an optional
/// per-call cap on accepted written bytes.
pub(crate) struct ScriptedStream {
    reads: VecDeque<ReadStep>,
    accept_per_call: Option<usize>,
    written: Vec<u8>,
}

impl ScriptedStream {
    pub(crate) fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            accept_per_call: None,
            written: Vec::new(),
        }
    }

    pub(crate) fn with_reads(steps: impl IntoIterator<Item = ReadStep>) -> Self {
        Self {
            reads: steps.into_iter().collect(),
            accept_per_call: None,
            written: Vec::new(),
        }
    }

    /// Caps each `writev` call at `n` accepted bytes, simulating a congested
    /// socket.
    pub(crate) fn accepting_per_call(n: usize) -> Self {
        Self {
            reads: VecDeque::new(),
            accept_per_call: Some(n),
            written: Vec::new(),
        }
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }
}

impl IoStream for ScriptedStream {
    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None | Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(io::Error::from(kind)),
            Some(ReadStep::Data(bytes)) => {
                let mut copied = 0;
                for buf in bufs {
                    if copied == bytes.len() {
                        break;
                    }
                    let n = buf.len().min(bytes.len() - copied);
                    buf[..n].copy_from_slice(&bytes[copied..copied + n]);
                    copied += n;
                }
                assert_eq!(copied, bytes.len(), "scripted data exceeds the supplied buffers");
                Ok(copied)
            }
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut budget = self.accept_per_call.unwrap_or(usize::MAX);
        let mut accepted = 0;

        for buf in bufs {
            if budget == 0 {
                break;
            }
            let n = buf.len().min(budget);
            self.written.extend_from_slice(&buf[..n]);
            accepted += n;
            budget -= n;
        }

        Ok(accepted)
    }
}
