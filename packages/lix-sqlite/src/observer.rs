use crate::commit::CommitSummary;

/// Handle returned by [`crate::Lix::on_commit`], used to unregister the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

type Callback = Box<dyn FnMut(&[CommitSummary]) + Send>;

/// Commit callbacks, fired synchronously once the storage transaction has committed.
#[derive(Default)]
pub(crate) struct Observers {
    next: u64,
    callbacks: Vec<(ObserverId, Callback)>,
}

impl Observers {
    pub(crate) fn add(&mut self, callback: Callback) -> ObserverId {
        self.next += 1;
        let id = ObserverId(self.next);
        self.callbacks.push((id, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    pub(crate) fn notify(&mut self, summaries: &[CommitSummary]) {
        if summaries.is_empty() {
            return;
        }
        for (_, callback) in &mut self.callbacks {
            callback(summaries);
        }
    }
}
