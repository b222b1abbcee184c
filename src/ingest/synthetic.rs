//! Synthetic `stub://` camera.
//!
//! Locator format: `stub://<name>?width=&height=&fps=&fail_at=&fail_count=&fail_connect=`.
//! `fail_at=N` makes polls after the N-th fail, `fail_count` times (forever when
//! omitted). `fail_connect=true` refuses every connection attempt.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use url::Url;

use super::{frame_interval, FrameSource, Resolution};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub fail_at: Option<u64>,
    pub fail_count: Option<u64>,
    pub fail_connect: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            fail_at: None,
            fail_count: None,
            fail_connect: false,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(locator: &str) -> Result<Self> {
        let url = Url::parse(locator).with_context(|| format!("parse stub locator {}", locator))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("not a stub locator: {}", locator));
        }
        let mut config = SyntheticConfig {
            name: url.host_str().unwrap_or("stub").to_string(),
            ..SyntheticConfig::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => config.width = value.parse().context("stub width")?,
                "height" => config.height = value.parse().context("stub height")?,
                "fps" => config.target_fps = value.parse().context("stub fps")?,
                "fail_at" => config.fail_at = Some(value.parse().context("stub fail_at")?),
                "fail_count" => {
                    config.fail_count = Some(value.parse().context("stub fail_count")?)
                }
                "fail_connect" => config.fail_connect = value == "true" || value == "1",
                other => log::warn!("SyntheticSource: ignoring unknown option '{}'", other),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("stub camera {} has an empty resolution", config.name));
        }
        Ok(config)
    }
}

/// Camera producing a moving gradient, with scriptable failures.
pub struct SyntheticSource {
    config: SyntheticConfig,
    locator: String,
    connected: bool,
    polls: u64,
    frame_count: u64,
    seed: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let seed = config.name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        let locator = format!("stub://{}", config.name);
        Self {
            config,
            locator,
            connected: false,
            polls: 0,
            frame_count: 0,
            seed,
            last_frame_at: None,
        }
    }

    pub fn from_locator(locator: &str) -> Result<Self> {
        let mut source = Self::new(SyntheticConfig::parse(locator)?);
        source.locator = locator.to_string();
        Ok(source)
    }

    fn poll_fails(&self) -> bool {
        let Some(fail_at) = self.config.fail_at else {
            return false;
        };
        if self.polls <= fail_at {
            return false;
        }
        match self.config.fail_count {
            Some(count) => self.polls <= fail_at + count,
            None => true,
        }
    }

    fn render(&self) -> RgbImage {
        let shift = (self.frame_count % 256) as u32;
        let seed = self.seed as u32;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + seed) % 256) as u8,
                ((x / 8 + y / 8 + seed) % 256) as u8,
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        if self.config.fail_connect {
            return Err(anyhow!("stub camera {} refuses connections", self.config.name));
        }
        self.connected = true;
        log::info!("SyntheticSource: connected to {} (synthetic)", self.locator);
        Ok(())
    }

    fn next_image(&mut self) -> Result<RgbImage> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        self.polls += 1;
        if self.poll_fails() {
            return Err(anyhow!(
                "stub camera {} dropped frame (poll {})",
                self.config.name,
                self.polls
            ));
        }

        let min_interval = frame_interval(self.config.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                std::thread::sleep(min_interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(self.render())
    }

    fn list_resolutions(&mut self) -> Result<Vec<Resolution>> {
        Ok(vec![Resolution::new(self.config.width, self.config.height)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_options_are_parsed() -> Result<()> {
        let config = SyntheticConfig::parse("stub://gate?width=64&height=48&fps=0&fail_at=2")?;
        assert_eq!(config.name, "gate");
        assert_eq!((config.width, config.height), (64, 48));
        assert_eq!(config.fail_at, Some(2));
        assert_eq!(config.fail_count, None);
        Ok(())
    }

    #[test]
    fn scripted_failures_recover() -> Result<()> {
        let mut source =
            SyntheticSource::from_locator("stub://cam?width=8&height=8&fps=0&fail_at=1&fail_count=2")?;
        source.connect()?;
        assert!(source.next_image().is_ok());
        assert!(source.next_image().is_err());
        assert!(source.next_image().is_err());
        assert!(source.next_image().is_ok());
        assert_eq!(source.frame_count, 2);
        Ok(())
    }

    #[test]
    fn refusing_source_never_connects() -> Result<()> {
        let mut source = SyntheticSource::from_locator("stub://dead?fail_connect=true")?;
        assert!(source.connect().is_err());
        assert!(source.next_image().is_err());
        Ok(())
    }
}
