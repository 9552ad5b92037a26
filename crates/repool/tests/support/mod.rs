//! Shared counting factory for pool integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use repool::{PoolError, RecycleError, ResourceFactory, Reusable};

pub struct Session {
    pub id: usize,
    pub fail_recycle: AtomicBool,
}

impl Reusable for Session {
    fn recycle(&self) -> Result<(), RecycleError> {
        if self.fail_recycle.load(Ordering::SeqCst) {
            return Err(RecycleError::new("session refused to recycle"));
        }
        Ok(())
    }
}

/// Factory that counts lifecycle calls and can be told to reject
/// specific sessions at validation time.
#[derive(Default)]
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub destroyed: Arc<AtomicUsize>,
    pub invalid: Mutex<Vec<usize>>,
    pub validations_failed: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn mark_invalid(&self, id: usize) {
        self.invalid.lock().push(id);
    }
}

impl ResourceFactory for CountingFactory {
    type Item = Session;

    fn create(&self) -> Result<Arc<Session>, PoolError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Session {
            id,
            fail_recycle: AtomicBool::new(false),
        }))
    }

    fn validate(&self, item: &Session) -> bool {
        let valid = !self.invalid.lock().contains(&item.id);
        if !valid {
            self.validations_failed.fetch_add(1, Ordering::SeqCst);
        }
        valid
    }

    fn destroy(&self, _item: &Session) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
