//! Items and spider parse output.

use crate::request::Request;
use serde::Serialize;
use std::fmt::Debug;

/// Anything a spider can scrape: serializable, cloneable and shareable across tasks.
pub trait ScrapedItem: Serialize + Clone + Debug + Send + Sync + 'static {}

impl<T> ScrapedItem for T where T: Serialize + Clone + Debug + Send + Sync + 'static {}

/// One element of a spider's output.
#[derive(Debug, Clone)]
pub enum Output<I> {
    Item(I),
    Request(Request),
}

/// Ordered, finite output of one `Spider::parse` call.
#[derive(Debug, Clone)]
pub struct ParseOutput<I> {
    outputs: Vec<Output<I>>,
}

impl<I> Default for ParseOutput<I> {
    fn default() -> Self {
        ParseOutput { outputs: Vec::new() }
    }
}

impl<I> ParseOutput<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, item: I) {
        self.outputs.push(Output::Item(item));
    }

    pub fn add_request(&mut self, request: Request) {
        self.outputs.push(Output::Request(request));
    }

    pub fn add_items(&mut self, items: impl IntoIterator<Item = I>) {
        self.outputs.extend(items.into_iter().map(Output::Item));
    }

    pub fn add_requests(&mut self, requests: impl IntoIterator<Item = Request>) {
        self.outputs.extend(requests.into_iter().map(Output::Request));
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Output<I>> {
        self.outputs.iter()
    }

    /// Splits the output into items and requests, each in yield order.
    pub fn into_parts(self) -> (Vec<I>, Vec<Request>) {
        let mut items = Vec::new();
        let mut requests = Vec::new();
        for output in self.outputs {
            match output {
                Output::Item(item) => items.push(item),
                Output::Request(request) => requests.push(request),
            }
        }
        (items, requests)
    }
}

impl<I> IntoIterator for ParseOutput<I> {
    type Item = Output<I>;
    type IntoIter = std::vec::IntoIter<Output<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outputs.into_iter()
    }
}

impl<I> FromIterator<Output<I>> for ParseOutput<I> {
    fn from_iter<T: IntoIterator<Item = Output<I>>>(iter: T) -> Self {
        ParseOutput {
            outputs: iter.into_iter().collect(),
        }
    }
}
