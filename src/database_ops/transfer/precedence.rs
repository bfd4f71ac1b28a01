//! Ordered candidate lists. Every "A, else B, else C" decision in a run goes through
//! [`Precedence`] so the source that won can be traced.

use std::fmt::Debug;
use tracing::debug;

pub struct Precedence<T> {
    what: &'static str,
    winner: Option<(&'static str, T)>,
}

impl<T: Debug> Precedence<T> {
    pub fn new(what: &'static str) -> Self {
        Self { what, winner: None }
    }

    /// Offer a candidate; ignored once something has won.
    pub fn or(mut self, source: &'static str, value: Option<T>) -> Self {
        if self.winner.is_none() {
            self.winner = value.map(|v| (source, v));
        }
        self
    }

    /// Like [`or`](Self::or) but the candidate is only computed while nothing has won.
    pub fn or_else(self, source: &'static str, f: impl FnOnce() -> Option<T>) -> Self {
        if self.winner.is_some() {
            return self;
        }
        let value = f();
        self.or(source, value)
    }

    pub fn resolve(self) -> Option<T> {
        self.resolve_with_source().map(|(_, v)| v)
    }

    pub fn resolve_with_source(self) -> Option<(&'static str, T)> {
        match &self.winner {
            Some((source, value)) => debug!(what = self.what, source, ?value, "precedence resolved"),
            None => debug!(what = self.what, "precedence: no candidate"),
        }
        self.winner
    }
}

/// An empty list is "no opinion".
pub fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    Some(v).filter(|v| !v.is_empty())
}
