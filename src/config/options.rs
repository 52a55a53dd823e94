//! Runtime options for the request pipeline, from code or environment.

/// Default capacity of the streaming output channel.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Skip type-driven conversion; bodies are shallow-copied instead.
    pub disable_entity_conversion: bool,
    /// Chunks the streaming transform may queue before waiting on the consumer.
    pub stream_buffer: usize,
    /// Service root path appended to `protocol://host` (e.g. `/odata`).
    pub base_path: String,
    /// Protocol used when the request does not say otherwise.
    pub protocol: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            disable_entity_conversion: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            base_path: String::new(),
            protocol: "http".into(),
        }
    }
}

impl ProcessorOptions {
    /// Read `ODATA_*` variables (a `.env` file is honored); unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        let mut options = ProcessorOptions::default();
        if let Ok(v) = dotenvy::var("ODATA_DISABLE_ENTITY_CONVERSION") {
            options.disable_entity_conversion = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = dotenvy::var("ODATA_STREAM_BUFFER").ok().and_then(|v| v.parse::<usize>().ok()) {
            options.stream_buffer = n.max(1);
        }
        if let Ok(v) = dotenvy::var("ODATA_BASE_PATH") {
            options.base_path = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = dotenvy::var("ODATA_PROTOCOL") {
            if !v.is_empty() {
                options.protocol = v;
            }
        }
        options
    }
}
