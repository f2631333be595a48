//! Filter executor: predicate evaluation over a child.

use super::{Executor, Predicate, Tuple};
use nimbus_common::Result;

/// Passes through tuples satisfying the conjunction of all predicates.
pub struct Filter<'a> {
    child: Box<dyn Executor + 'a>,
    predicates: Vec<Predicate>,
}

impl<'a> Filter<'a> {
    /// Wraps a child executor with a predicate list.
    pub fn new(child: Box<dyn Executor + 'a>, predicates: Vec<Predicate>) -> Self {
        Self { child, predicates }
    }
}

impl Executor for Filter<'_> {
    fn init(&mut self) -> Result<()> {
        self.child.init()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(tuple) = self.child.next()? {
            if self.predicates.iter().all(|p| p.evaluate(&tuple.doc)) {
                return Ok(Some(tuple));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.child.close();
    }
}
