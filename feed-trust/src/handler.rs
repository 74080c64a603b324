// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Interaction with whoever drives an operation. */

use {crate::Result, implementation_store::CancellationToken, log::warn};

/// Answers questions and carries the cancellation signal for an operation.
pub trait TaskHandler {
    fn cancellation(&self) -> &CancellationToken;

    /// Ask a yes/no question.
    ///
    /// `batch_information` summarizes the question for handlers that cannot
    /// ask. Handlers unable to obtain an answer must return `false`.
    fn ask_question(&self, question: &str, batch_information: Option<&str>) -> Result<bool>;
}

/// A handler for non-interactive use. Every question is answered with no.
#[derive(Clone, Debug, Default)]
pub struct BatchHandler {
    cancel: CancellationToken,
}

impl BatchHandler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl TaskHandler for BatchHandler {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn ask_question(&self, question: &str, batch_information: Option<&str>) -> Result<bool> {
        self.cancel.check()?;
        warn!("{}", batch_information.unwrap_or(question));

        Ok(false)
    }
}
