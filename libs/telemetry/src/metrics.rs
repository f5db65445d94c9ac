use metrics::{Label, counter, histogram};

use crate::context::MessageLabels;

fn labels(tags: &MessageLabels) -> Vec<Label> {
    tags.tags()
        .into_iter()
        .map(|(key, value)| Label::new(key, value))
        .collect()
}

pub fn record_counter(name: &'static str, value: u64, tags: &MessageLabels) {
    counter!(name, labels(tags)).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, tags: &MessageLabels) {
    histogram!(name, labels(tags)).record(value);
}
