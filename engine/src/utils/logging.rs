use const_format::concatcp;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ENV_PREFIX;

const ENV_LOG: &str = concatcp!(ENV_PREFIX, "_LOG");

pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    // try_init: embedders may have installed their own subscriber already.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_indent_lines(true))
        .try_init();
}
