use std::num::NonZero;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
/// An opaque identifier for an operation running on a connection
///
/// Ids are handed out by a counter on the client and never reused, so a
/// late message for an operation that has since been restarted can't be
/// mistaken for one meant for its replacement.
pub(crate) struct OperationId(NonZero<usize>);

impl OperationId {
    pub(super) fn new(id: usize) -> Option<Self> {
        Some(OperationId(NonZero::new(id)?))
    }

    #[expect(clippy::inherent_to_string)]
    pub(super) fn to_string(self) -> String {
        self.0.to_string()
    }
}
