use futures::StreamExt as _;
use futures::stream;
use runtrace_core::prelude::*;

/// Streams the characters of its input in reverse order, one chunk each.
pub fn reverse_unit() -> impl Runnable<Input = String, Output = String> {
    StreamingLambda::new("reverse", |text: String| {
        let chars: Vec<String> = text.chars().rev().map(String::from).collect();
        stream::iter(chars.into_iter().map(Ok::<_, UnitError>)).boxed()
    })
}
