use async_trait::async_trait;
use image::GenericImageView;
use reqwest::Client;

use crate::error::IngestError;

/// Longest edge the quantiser works on.
const SAMPLE_EDGE: u32 = 64;

/// Pixels with less alpha than this are treated as background.
const MIN_ALPHA: u8 = 125;

/// Where cover art bytes come from.
#[async_trait]
pub trait CoverArtSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, IngestError>;
}

pub struct HttpCoverArt {
    http: Client,
}

impl HttpCoverArt {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CoverArtSource for HttpCoverArt {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        let fetch_err = |reason: String| IngestError::CoverArtFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        if !response.status().is_success() {
            tracing::warn!("cover art request returned status {}: {}", response.status(), url);
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        tracing::debug!("received {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

/// Fetch an image and reduce it to at most `count` representative colours.
/// Decoding and quantisation run on the blocking pool.
pub async fn palette_for(
    source: &dyn CoverArtSource,
    url: &str,
    count: usize,
) -> Result<Vec<String>, IngestError> {
    let bytes = source.fetch(url).await?;

    tokio::task::spawn_blocking(move || extract_palette(&bytes, count))
        .await
        .map_err(|e| IngestError::CoverArtDecode(format!("palette task failed: {}", e)))?
}

/// Decode `bytes` and return up to `count` `#rrggbb` colours, most common
/// first, using median-cut quantisation.
pub fn extract_palette(bytes: &[u8], count: usize) -> Result<Vec<String>, IngestError> {
    let img =
        image::load_from_memory(bytes).map_err(|e| IngestError::CoverArtDecode(e.to_string()))?;

    let (width, height) = img.dimensions();
    let sample = if width > SAMPLE_EDGE || height > SAMPLE_EDGE {
        img.thumbnail(SAMPLE_EDGE, SAMPLE_EDGE)
    } else {
        img
    };

    let pixels: Vec<[u8; 3]> = sample
        .to_rgba8()
        .pixels()
        .filter(|p| p[3] >= MIN_ALPHA)
        .map(|p| [p[0], p[1], p[2]])
        .collect();

    Ok(median_cut(pixels, count)
        .into_iter()
        .map(|([r, g, b], _)| format!("#{:02x}{:02x}{:02x}", r, g, b))
        .collect())
}

fn median_cut(pixels: Vec<[u8; 3]>, count: usize) -> Vec<([u8; 3], usize)> {
    if pixels.is_empty() || count == 0 {
        return Vec::new();
    }

    let mut boxes = vec![pixels];

    while boxes.len() < count {
        let candidate = boxes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let (channel, range) = widest_channel(b);
                (i, channel, range as usize * b.len())
            })
            .filter(|(_, _, score)| *score > 0)
            .max_by_key(|(_, _, score)| *score);

        let Some((index, channel, _)) = candidate else {
            break;
        };

        let mut lower = boxes.swap_remove(index);
        lower.sort_unstable_by_key(|p| p[channel]);
        let upper = lower.split_off(lower.len() / 2);
        boxes.push(lower);
        boxes.push(upper);
    }

    // Splitting a box at a run of equal values can yield two boxes with the
    // same mean, so merge identical colours.
    let mut colours: Vec<([u8; 3], usize)> = Vec::with_capacity(boxes.len());
    for b in boxes.iter().filter(|b| !b.is_empty()) {
        let mean = average(b);
        match colours.iter_mut().find(|(c, _)| *c == mean) {
            Some((_, n)) => *n += b.len(),
            None => colours.push((mean, b.len())),
        }
    }

    colours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    colours
}

fn widest_channel(pixels: &[[u8; 3]]) -> (usize, u8) {
    (0..3)
        .map(|channel| {
            let (min, max) = pixels.iter().fold((u8::MAX, u8::MIN), |(lo, hi), p| {
                (lo.min(p[channel]), hi.max(p[channel]))
            });
            (channel, max.saturating_sub(min))
        })
        .max_by_key(|(_, range)| *range)
        .unwrap_or((0, 0))
}

fn average(pixels: &[[u8; 3]]) -> [u8; 3] {
    let n = pixels.len().max(1) as u64;
    let sums = pixels.iter().fold([0u64; 3], |mut acc, p| {
        for c in 0..3 {
            acc[c] += p[c] as u64;
        }
        acc
    });
    [
        ((sums[0] + n / 2) / n) as u8,
        ((sums[1] + n / 2) / n) as u8,
        ((sums[2] + n / 2) / n) as u8,
    ]
}
