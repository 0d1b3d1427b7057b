//! Built-in components for the Athena pipeline engine.
//!
//! | role     | type           | summary                                        |
//! |----------|----------------|------------------------------------------------|
//! | source   | `mock`         | synthetic access-log lines on an interval      |
//! | source   | `file`         | lines of a text file, resumable by byte offset |
//! | operator | `sample`       | forwards every n-th event                      |
//! | operator | `switch`       | routes by a meta field to named tasks          |
//! | operator | `window-count` | per-bucket event counts                        |
//! | sink     | `echo`         | logs events                                    |

use std::sync::OnceLock;

use athena_runtime::{ComponentContext, ComponentRegistry};
use athena_types::{AthenaError, Result};

pub mod echo;
pub mod file;
pub mod mock;
pub mod sample;
pub mod switch;
pub mod window_count;

pub use echo::EchoSink;
pub use file::FileSource;
pub use mock::{MockSource, MOCK_LINE};
pub use sample::SampleOperator;
pub use switch::SwitchOperator;
pub use window_count::WindowCountOperator;

/// Register every built-in component under its type name.
pub fn register_builtins(registry: &mut ComponentRegistry) {
    registry.register_source("mock", MockSource::new);
    registry.register_source("file", FileSource::new);
    registry.register_operator("sample", SampleOperator::new);
    registry.register_operator("switch", SwitchOperator::new);
    registry.register_operator("window-count", WindowCountOperator::new);
    registry.register_sink("echo", EchoSink::new);
}

/// A registry holding only the built-ins.
pub fn default_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    register_builtins(&mut registry);
    registry
}

/// The context stored by `open`, or an error naming the phase that needed it.
pub(crate) fn opened<'a>(
    ctx: &'a OnceLock<ComponentContext>,
    component: &str,
    phase: &str,
) -> Result<&'a ComponentContext> {
    ctx.get()
        .ok_or_else(|| AthenaError::component(component, phase, "component was not opened"))
}
