use crate::Environment;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use tracing_subscriber::{prelude::*, reload, EnvFilter, Registry};

/// Reload handle for the global filter, set once by [`init_tracing`].
static FILTER: OnceCell<FilterControl> = OnceCell::new();

struct FilterControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    overrides: Mutex<BTreeMap<String, String>>,
}

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operations to ensure
/// colored error output. Safe to call multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing with environment-aware configuration and error span capture.
///
/// - **Production** (`APP_ENV=production`): JSON lines, module targets hidden,
///   default filter `warn`.
/// - **Development** (default): pretty output, default filter `info`.
///
/// `RUST_LOG` overrides the default filter. The filter is installed behind a
/// reload layer so [`set_target_level`] can adjust individual targets later,
/// which is how client configuration applies its broker log level.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();
    let default_directives = if is_production { "warn" } else { "info" };

    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_directives.to_string());
    let filter = EnvFilter::try_new(&base).unwrap_or_else(|_| EnvFilter::new(default_directives));
    let (filter, handle) = reload::Layer::new(filter);

    let result = if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .try_init()
    };

    match result {
        Ok(_) => {
            let _ = FILTER.set(FilterControl {
                handle,
                base,
                overrides: Mutex::new(BTreeMap::new()),
            });
            info!(environment = ?environment, "Tracing initialized");
        }
        Err(_) => {
            // Already initialized, common in tests
            debug!("Tracing already initialized, skipping re-initialization");
        }
    }
}

/// Override the level of a single target (e.g. `async_nats=warn`).
///
/// Returns `false` when the global subscriber was not installed by
/// [`init_tracing`] or the directive is rejected; the override is then a no-op.
pub fn set_target_level(target: &str, level: &str) -> bool {
    let Some(control) = FILTER.get() else {
        debug!(target_name = %target, level = %level, "Tracing not managed here, ignoring level override");
        return false;
    };

    let mut overrides = control
        .overrides
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    overrides.insert(target.to_string(), level.to_string());

    let directives = compose_directives(&control.base, &overrides);
    match EnvFilter::try_new(&directives) {
        Ok(filter) => match control.handle.reload(filter) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to reload tracing filter");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, directives = %directives, "Rejected tracing directive");
            false
        }
    }
}

fn compose_directives(base: &str, overrides: &BTreeMap<String, String>) -> String {
    let mut directives = base.to_string();
    for (target, level) in overrides {
        directives.push(',');
        directives.push_str(target);
        directives.push('=');
        directives.push_str(level);
    }
    directives
}
