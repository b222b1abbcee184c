//! MJPEG-over-HTTP camera source.
//!
//! Handles the two shapes IP cameras and ESP32 peers serve:
//! - `multipart/x-mixed-replace` streams, split on JPEG SOI/EOI markers
//! - single JPEG snapshots, re-requested for every frame
//!
//! `connect` doubles as the connectivity check: it succeeds only once the HTTP
//! request went through and a first frame decoded.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use image::RgbImage;
use url::Url;

use super::{frame_interval, FrameSource};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegSource {
    url: String,
    target_fps: u32,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    pending: Option<RgbImage>,
    last_frame_at: Option<Instant>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(url: &str, target_fps: u32, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse camera url {}", url))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Ok(Self {
            url: url.to_string(),
            target_fps,
            agent,
            stream: None,
            pending: None,
            last_frame_at: None,
        })
    }

    fn open_stream(&mut self) -> Result<RgbImage> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            let mut stream = MjpegStream::new(response.into_reader());
            let first = decode_jpeg(&stream.read_next_jpeg()?)?;
            self.stream = Some(HttpStream::Mjpeg(stream));
            Ok(first)
        } else {
            let bytes = read_body(response)?;
            self.stream = Some(HttpStream::SingleJpeg);
            decode_jpeg(&bytes)
        }
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let first = self.open_stream()?;
        log::info!(
            "MjpegSource: connected to {} ({}x{})",
            self.url,
            first.width(),
            first.height()
        );
        self.pending = Some(first);
        Ok(())
    }

    fn next_image(&mut self) -> Result<RgbImage> {
        if let Some(first) = self.pending.take() {
            self.last_frame_at = Some(Instant::now());
            return Ok(first);
        }
        let min_interval = frame_interval(self.target_fps);
        // Snapshots cost one request each, so wait out the interval instead of
        // fetching and discarding.
        if let (Some(HttpStream::SingleJpeg), Some(last)) = (&self.stream, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                std::thread::sleep(min_interval - elapsed);
            }
        }
        loop {
            let jpeg_bytes = match &mut self.stream {
                Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
                Some(HttpStream::SingleJpeg) => fetch_single_jpeg(&self.agent, &self.url),
                None => Err(anyhow!(
                    "camera {} not connected; call connect() first",
                    self.url
                )),
            };
            let jpeg_bytes = match jpeg_bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.stream = None;
                    return Err(err);
                }
            };

            let now = Instant::now();
            let streaming = matches!(self.stream, Some(HttpStream::Mjpeg(_)));
            if let Some(last) = self.last_frame_at {
                if streaming && now.duration_since(last) < min_interval {
                    continue;
                }
            }

            let image = decode_jpeg(&jpeg_bytes)?;
            self.last_frame_at = Some(now);
            return Ok(image);
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    read_body(response)
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Cursor, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([90, 120, 200]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .expect("encode jpeg");
        out.into_inner()
    }

    #[test]
    fn jpeg_bounds_skip_multipart_headers() {
        let mut buffer = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        buffer.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buffer.extend_from_slice(b"\r\n--frame");
        let (start, end) = find_jpeg_bounds(&buffer).expect("bounds");
        assert_eq!(&buffer[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn mjpeg_stream_yields_consecutive_frames() -> Result<()> {
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg(16, 8));
            body.extend_from_slice(b"\r\n");
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        let first = decode_jpeg(&stream.read_next_jpeg()?)?;
        assert_eq!(first.dimensions(), (16, 8));
        assert!(stream.read_next_jpeg().is_ok());
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(MjpegSource::new("rtsp://10.0.0.5/stream", 10, Duration::from_secs(1)).is_err());
    }

    fn serve_snapshots(limit: usize) -> Result<(String, Arc<AtomicUsize>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/snapshot.jpg", listener.local_addr()?);
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let body = jpeg(8, 8);
        std::thread::spawn(move || {
            for stream in listener.incoming().take(limit) {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().expect("clone socket"));
                let mut line = String::new();
                while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
                    if line == "\r\n" {
                        break;
                    }
                    line.clear();
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        Ok((url, requests))
    }

    #[test]
    fn snapshot_mode_issues_one_request_per_frame() -> Result<()> {
        let (url, requests) = serve_snapshots(4)?;
        let mut source = MjpegSource::new(&url, 5, Duration::from_secs(2))?;
        source.connect()?;
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        for _ in 0..4 {
            assert_eq!(source.next_image()?.dimensions(), (8, 8));
        }
        assert_eq!(requests.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(550));
        Ok(())
    }
}
