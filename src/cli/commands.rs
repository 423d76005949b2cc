use anyhow::Result;
use std::fmt::Write as FmtWrite;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::core::Core;
use crate::lb::{HealthReport, HealthStatus};

/// Human readable age, e.g. `850ms`, `12s`, `3m04s`
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs == 0 {
        format!("{}ms", age.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// Render a health report as one header line plus one line per endpoint
pub fn format_report(hostname: &str, report: &HealthReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({}/{} healthy)",
        hostname,
        report.status,
        report.healthy_count(),
        report.endpoints.len()
    );

    for endpoint in &report.endpoints {
        let state = if endpoint.healthy { "up" } else { "down" };
        let age = endpoint
            .last_check
            .map(format_age)
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(
            out,
            "  {:<4} {:<24} checked {} ago  {}",
            state,
            endpoint.addr,
            age,
            endpoint.health_uri.as_deref().unwrap_or("-")
        );
    }
    out
}

/// Print the pool health; fails when no endpoint is healthy
pub async fn cmd_check(core: &Core) -> Result<()> {
    let report = core.check();
    print!("{}", format_report(&core.config.hostname, &report));

    if report.status == HealthStatus::Error {
        anyhow::bail!("No healthy endpoint for {}", core.config.hostname);
    }
    Ok(())
}

/// Print the addresses DNS currently returns
pub async fn cmd_resolve(core: &Core) -> Result<()> {
    let addrs = core.resolve().await?;
    if addrs.is_empty() {
        println!("{}: no addresses", core.config.hostname);
    }
    for ip in addrs {
        println!("{}", ip);
    }
    Ok(())
}

/// GET a path and print status, headers and body
pub async fn cmd_get(core: &Core, path: &str, include_headers: bool) -> Result<()> {
    let response = core.get(path).await?;

    if include_headers {
        println!("{:?} {}", response.version(), response.status());
        for (name, value) in response.headers() {
            println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
        println!();
    } else {
        eprintln!("{}", response.status());
    }

    print!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}

/// Print the health report every `every` until Ctrl-C
pub async fn cmd_watch(core: &Core, every: Duration) -> Result<()> {
    if every.is_zero() {
        anyhow::bail!("watch interval must be at least one second");
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print!("{}", format_report(&core.config.hostname, &core.check()));
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    core.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::EndpointHealth;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_millis(850)), "850ms");
        assert_eq!(format_age(Duration::from_secs(12)), "12s");
        assert_eq!(format_age(Duration::from_secs(184)), "3m04s");
    }

    #[test]
    fn test_format_report() {
        let report = HealthReport {
            status: HealthStatus::Warning,
            endpoints: vec![
                EndpointHealth {
                    addr: "10.0.0.1:443".parse().unwrap(),
                    health_uri: Some("https://10.0.0.1:443/health".to_string()),
                    healthy: true,
                    last_check: Some(Duration::from_secs(3)),
                },
                EndpointHealth {
                    addr: "10.0.0.2:443".parse().unwrap(),
                    health_uri: None,
                    healthy: false,
                    last_check: None,
                },
            ],
        };

        let out = format_report("api.example.com", &report);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "api.example.com WARNING (1/2 healthy)");
        assert!(lines[1].contains("up") && lines[1].contains("checked 3s ago"));
        assert!(lines[2].contains("down") && lines[2].contains("never"));
    }
}
