//! Progress reporting.
//!
//! The executor only knows about `finish` hooks; progress is a wrapper that
//! ticks an [`indicatif`] bar and then forwards to the user's own hook.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::options::FinishHook;

pub(crate) fn finish_hook<I, O>(
    title: String,
    total: usize,
    inner: Option<FinishHook<I, O>>,
) -> FinishHook<I, O>
where
    I: 'static,
    O: 'static,
{
    let bar = ProgressBar::new(total as u64);
    bar.set_style(bar_style());
    bar.set_message(title);

    Arc::new(move |item: &I, index: usize, result: Option<&O>| {
        bar.inc(1);
        if Some(bar.position()) >= bar.length() {
            bar.finish();
        }
        if let Some(inner) = &inner {
            inner(item, index, result);
        }
    })
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} |{bar:40}| {pos}/{len} [{elapsed}]")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
