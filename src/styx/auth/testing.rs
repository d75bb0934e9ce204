//! In-process blob pump for handler unit tests.

use std::collections::VecDeque;

use crate::styx::blob::Blob;
use crate::styx::error::AuthError;
use crate::styx::mode::ProcessingMode;

use super::traits::AuthProtocolHandler;

const MAX_STEPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Produce,
    Receive,
    Consume,
}

struct Party<'a> {
    handler: &'a mut dyn AuthProtocolHandler,
    next: Next,
    blob: Blob,
    outcome: Option<ProcessingMode>,
}

impl<'a> Party<'a> {
    fn new(handler: &'a mut dyn AuthProtocolHandler, capacity: usize) -> Self {
        Self {
            handler,
            next: Next::Produce,
            blob: Blob::with_capacity(capacity),
            outcome: None,
        }
    }

    /// Run one handler call. Returns whether anything happened.
    fn step(
        &mut self,
        inbox: &mut VecDeque<Vec<u8>>,
        outbox: &mut VecDeque<Vec<u8>>,
    ) -> Result<bool, AuthError> {
        if self.outcome.is_some() {
            return Ok(false);
        }
        let mode = match self.next {
            Next::Produce => {
                self.blob.clear();
                let mode = self.handler.get_data_for_peer(&mut self.blob)?;
                if !self.blob.is_empty() {
                    outbox.push_back(self.blob.as_slice().to_vec());
                }
                mode
            }
            Next::Receive => {
                let Some(frame) = inbox.pop_front() else {
                    return Ok(false);
                };
                self.blob.clear();
                self.blob.write(&frame);
                self.handler.handle_peer_data(&mut self.blob)?
            }
            Next::Consume => self.handler.handle_peer_data(&mut self.blob)?,
        };
        match mode {
            ProcessingMode::NeedData => self.next = Next::Receive,
            ProcessingMode::PendingData => self.next = Next::Produce,
            ProcessingMode::Continue | ProcessingMode::Wait { .. } => {
                if self.next == Next::Receive {
                    self.next = Next::Consume;
                }
            }
            other => self.outcome = Some(other),
        }
        Ok(true)
    }
}

/// Outcome of a pumped exchange; `None` means the party never finished.
pub(crate) type Outcomes = (Option<ProcessingMode>, Option<ProcessingMode>);

/// Shuttle blobs between two handlers until neither can make progress.
///
/// `Wait` is treated as an immediate retry; tests that care about the delay
/// go through the negotiation driver and its clock.
pub(crate) fn exchange(
    client: &mut dyn AuthProtocolHandler,
    server: &mut dyn AuthProtocolHandler,
    capacity: usize,
) -> Result<Outcomes, AuthError> {
    let mut client = Party::new(client, capacity);
    let mut server = Party::new(server, capacity);
    let mut to_server = VecDeque::new();
    let mut to_client = VecDeque::new();

    for _ in 0..MAX_STEPS {
        let a = client.step(&mut to_client, &mut to_server)?;
        let b = server.step(&mut to_server, &mut to_client)?;
        if !a && !b {
            break;
        }
    }
    Ok((client.outcome, server.outcome))
}
