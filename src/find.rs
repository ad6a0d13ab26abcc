use std::marker::PhantomData;

use serde_json::Value;

use crate::collection::Collection;
use crate::document::Document;
use crate::error::Result;
use crate::query::Query;
use crate::shape::{Projection, SortSpec};

mod sealed {
    pub trait Sealed {}
}

/// Result mode of a [`Find`]: every match or the first one.
pub trait Mode: sealed::Sealed {
    type Output;

    #[doc(hidden)]
    fn finish(docs: Vec<Document>, limit: Option<usize>, projection: Option<&Projection>) -> Self::Output;
}

#[derive(Debug, Clone, Copy)]
pub struct Many;

#[derive(Debug, Clone, Copy)]
pub struct One;

impl sealed::Sealed for Many {}
impl sealed::Sealed for One {}

impl Mode for Many {
    type Output = Vec<Document>;

    fn finish(docs: Vec<Document>, limit: Option<usize>, projection: Option<&Projection>) -> Self::Output {
        let docs = docs.into_iter().take(limit.unwrap_or(usize::MAX));
        match projection {
            Some(p) => docs.map(|d| p.apply(&d)).collect(),
            None => docs.collect(),
        }
    }
}

impl Mode for One {
    type Output = Option<Document>;

    fn finish(docs: Vec<Document>, _limit: Option<usize>, projection: Option<&Projection>) -> Self::Output {
        let first = docs.into_iter().next()?;
        Some(match projection {
            Some(p) => p.apply(&first),
            None => first,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindState {
    /// Built, not executed yet.
    Configured,
    /// Executed `runs` times. Each run re-reads the backing file.
    Resolved { runs: usize },
}

/// Deferred read returned by [`Collection::find`] and
/// [`Collection::find_one`]. Nothing is read until [`Find::exec`].
///
/// Execution order: read, filter, sort, skip, limit, project.
#[must_use = "a Find does nothing until exec() is called"]
pub struct Find<M: Mode> {
    collection: Collection,
    query: Value,
    sort: Option<SortSpec>,
    projection: Option<Projection>,
    skip: usize,
    limit: Option<usize>,
    state: FindState,
    _mode: PhantomData<M>,
}

impl<M: Mode> Find<M> {
    pub(crate) fn new(collection: Collection, query: Value) -> Self {
        Self {
            collection,
            query,
            sort: None,
            projection: None,
            skip: 0,
            limit: None,
            state: FindState::Configured,
            _mode: PhantomData,
        }
    }

    /// Whitespace separated field list, `"name email"` or `"-password"`.
    /// Replaces any earlier selection; an empty list clears it.
    pub fn select(mut self, fields: &str) -> Self {
        self.projection = Projection::parse(fields);
        self
    }

    /// Replaces any earlier sort.
    pub fn sort(mut self, spec: SortSpec) -> Self {
        self.sort = (!spec.is_empty()).then_some(spec);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn state(&self) -> FindState {
        self.state
    }

    /// Run the read against the current contents of the backing file.
    pub fn exec(&mut self) -> Result<M::Output> {
        let query = Query::parse_with(&self.query, self.collection.strictness())?;

        let mut docs: Vec<Document> = self
            .collection
            .read_snapshot()
            .into_iter()
            .filter(|doc| query.matches(doc))
            .collect();
        if let Some(spec) = &self.sort {
            spec.apply(&mut docs);
        }
        if self.skip > 0 {
            docs.drain(..self.skip.min(docs.len()));
        }

        self.state = match self.state {
            FindState::Configured => FindState::Resolved { runs: 1 },
            FindState::Resolved { runs } => FindState::Resolved { runs: runs + 1 },
        };
        Ok(M::finish(docs, self.limit, self.projection.as_ref()))
    }
}

impl IntoIterator for Find<Many> {
    type Item = Result<Document>;
    type IntoIter = std::vec::IntoIter<Result<Document>>;

    fn into_iter(mut self) -> Self::IntoIter {
        match self.exec() {
            Ok(docs) => docs.into_iter().map(Ok).collect::<Vec<_>>().into_iter(),
            Err(e) => vec![Err(e)].into_iter(),
        }
    }
}
