//! Helper macro for parsing per-module configuration knobs.

/// Builds a configuration struct from its `Default` values, then overrides
/// the listed fields from an optional TOML string (typically taken verbatim
/// from a `--config` command line flag). Unknown field names in the TOML are
/// rejected so typos do not silently fall back to defaults.
///
/// Example:
/// ```no_run
/// let config = compose_config!(conf_str => ServerConfig; lease_valid_ms,
///                                                        lease_guard_ms)?;
/// ```
#[macro_export]
macro_rules! compose_config {
    ($conf_str:expr => $conf_type:ty; $($field:ident),+) => {{
        let conf_str: Option<&str> = $conf_str;

        // closure for easier error short-circuiting
        let build = || -> Result<$conf_type, LeaseKvError> {
            let mut config: $conf_type = Default::default();
            let Some(conf_str) = conf_str else {
                return Ok(config);
            };

            let mut table = conf_str.parse::<toml::Table>()?;
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // anything left in the table was not a recognized field name
            if let Some(unknown) = table.keys().next() {
                return Err(LeaseKvError(format!(
                    "unrecognized config field '{}'",
                    unknown
                )));
            }

            Ok(config)
        };

        build()
    }};
}
