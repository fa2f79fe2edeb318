use anyhow::{anyhow, Result};
use clap::Args;
use geotrace_trace::{
    Dialect, GeoLocator, IpApiLocator, NoopLocator, TraceSettings, Tracer, DEFAULT_GEO_URL,
};
use std::sync::Arc;
use std::time::Duration;

/// Options shared by every command that runs traces.
#[derive(Args, Debug, Clone)]
pub struct TraceOptions {
    /// Output format of the traceroute executable (unix, windows or auto).
    #[arg(long, env = "GEOTRACE_DIALECT", default_value = "auto")]
    pub dialect: String,

    #[arg(long, default_value_t = 30)]
    pub max_hops: u32,

    /// Seconds to wait for each probe reply.
    #[arg(long, default_value_t = 2)]
    pub wait_secs: u64,

    /// Kill the traceroute process after this many seconds.
    #[arg(long, env = "GEOTRACE_RUN_TIMEOUT_SECS", default_value_t = 120)]
    pub run_timeout_secs: u64,

    /// Base URL of an ip-api.com compatible geolocation service.
    #[arg(long, env = "GEOTRACE_GEO_URL", default_value = DEFAULT_GEO_URL)]
    pub geo_url: String,

    #[arg(long, env = "GEOTRACE_GEO_TIMEOUT_MS", default_value_t = 3000)]
    pub geo_timeout_ms: u64,

    /// How long a finished trace waits for outstanding lookups.
    #[arg(long, default_value_t = 5000)]
    pub settle_timeout_ms: u64,

    /// Skip geolocation entirely.
    #[arg(long)]
    pub no_geo: bool,
}

impl TraceOptions {
    pub fn settings(&self) -> Result<TraceSettings> {
        let dialect: Dialect = self.dialect.parse().map_err(|err: String| anyhow!(err))?;
        if self.max_hops == 0 {
            return Err(anyhow!("--max-hops must be at least 1"));
        }

        Ok(TraceSettings {
            dialect,
            max_hops: self.max_hops,
            wait_secs: self.wait_secs.max(1),
            run_timeout: Duration::from_secs(self.run_timeout_secs.max(1)),
            command: None,
        })
    }

    pub fn locator(&self) -> Arc<dyn GeoLocator> {
        if self.no_geo {
            Arc::new(NoopLocator)
        } else {
            Arc::new(IpApiLocator::new(
                self.geo_url.clone(),
                Duration::from_millis(self.geo_timeout_ms),
            ))
        }
    }

    pub fn tracer(&self) -> Result<Tracer> {
        Ok(Tracer::new(self.settings()?, self.locator())
            .with_settle_timeout(Duration::from_millis(self.settle_timeout_ms)))
    }
}
