//! Stream selection
//!
//! Turns the descriptors returned by the extraction tool into the concrete
//! streams a job downloads. A requested height that does not exist falls
//! back to the nearest available one (ties go to the lower height); media
//! without descriptors falls back to a combined selector expression.

use serde::Serialize;

use crate::core::models::{FormatDescriptor, FormatInfo, OutputFormat, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    Video,
    Audio,
    /// Video and audio in one stream
    Combined,
}

/// One stream the worker will fetch
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStream {
    /// Format id or selector expression
    pub selector: String,
    /// File-name safe tag for the intermediate file
    pub label: String,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub filesize: Option<u64>,
    pub kind: StreamKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlan {
    pub streams: Vec<PlannedStream>,
    /// No descriptors matched; a selector expression is used instead
    pub fallback: bool,
    pub estimated_total: Option<u64>,
}

impl StreamPlan {
    /// Whether the fetched streams must go through the remux tool, as
    /// opposed to a plain rename.
    pub fn needs_merge(&self, format: OutputFormat) -> bool {
        let [only] = self.streams.as_slice() else {
            return true;
        };
        if format.always_remux() {
            return true;
        }
        if !format.needs_audio() && only.kind == StreamKind::Combined {
            return true;
        }
        only.ext.as_deref() != Some(format.extension())
    }
}

/// Nearest available height; an exact match wins, equal distances go to
/// the lower height.
pub fn nearest_height(available: &[u32], target: u32) -> Option<u32> {
    if available.contains(&target) {
        return Some(target);
    }
    available
        .iter()
        .copied()
        .min_by_key(|height| (height.abs_diff(target), *height))
}

/// Pick the streams for `format` at `resolution` / `bitrate`
pub fn select_streams(
    info: &FormatInfo,
    format: OutputFormat,
    resolution: Resolution,
    bitrate: Option<u32>,
) -> StreamPlan {
    let video_only: Vec<&FormatDescriptor> = info
        .formats
        .iter()
        .filter(|f| f.has_video() && !f.has_audio())
        .collect();
    let audio_only: Vec<&FormatDescriptor> = info
        .formats
        .iter()
        .filter(|f| f.has_audio() && !f.has_video())
        .collect();
    let combined: Vec<&FormatDescriptor> = info
        .formats
        .iter()
        .filter(|f| f.has_video() && f.has_audio())
        .collect();

    let prefer_ext = match format {
        OutputFormat::Mp4WithAudio | OutputFormat::Mp4WithoutAudio => Some("mp4"),
        _ => None,
    };
    let prefer_audio_ext = prefer_ext.map(|_| "m4a");

    let streams = match format {
        OutputFormat::Mp4WithAudio | OutputFormat::Avi | OutputFormat::Mkv => {
            let video = pick_video(&video_only, resolution, prefer_ext);
            let audio = pick_audio(&audio_only, bitrate, prefer_audio_ext);
            match (video, audio) {
                (Some(video), Some(audio)) => {
                    Some(vec![planned(video, StreamKind::Video), planned(audio, StreamKind::Audio)])
                }
                _ => pick_video(&combined, resolution, prefer_ext)
                    .map(|av| vec![planned(av, StreamKind::Combined)]),
            }
        }
        OutputFormat::Mp4WithoutAudio => pick_video(&video_only, resolution, prefer_ext)
            .map(|video| vec![planned(video, StreamKind::Video)])
            .or_else(|| {
                pick_video(&combined, resolution, prefer_ext)
                    .map(|av| vec![planned(av, StreamKind::Combined)])
            }),
        OutputFormat::Mp3 => pick_audio(&audio_only, bitrate, None)
            .map(|audio| vec![planned(audio, StreamKind::Audio)])
            .or_else(|| {
                pick_audio(&combined, bitrate, None)
                    .map(|av| vec![planned(av, StreamKind::Combined)])
            }),
    };

    match streams {
        Some(streams) => {
            let estimated_total = streams
                .iter()
                .map(|s| s.filesize)
                .sum::<Option<u64>>()
                .or_else(|| info.size_estimate());
            StreamPlan {
                streams,
                fallback: false,
                estimated_total,
            }
        }
        None => StreamPlan {
            streams: vec![fallback_stream(info, format, resolution)],
            fallback: true,
            estimated_total: info.size_estimate(),
        },
    }
}

fn planned(descriptor: &FormatDescriptor, kind: StreamKind) -> PlannedStream {
    PlannedStream {
        selector: descriptor.format_id.clone(),
        label: stream_label(&descriptor.format_id),
        ext: descriptor.ext.clone(),
        height: descriptor.height,
        filesize: descriptor.size_estimate(),
        kind,
    }
}

fn stream_label(format_id: &str) -> String {
    let label: String = format_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if label.is_empty() {
        "stream".to_string()
    } else {
        label
    }
}

fn height_filter(resolution: Resolution) -> String {
    match resolution {
        Resolution::Best => String::new(),
        Resolution::MaxHeight(height) => format!("[height<={}]", height),
    }
}

fn fallback_stream(info: &FormatInfo, format: OutputFormat, resolution: Resolution) -> PlannedStream {
    let filter = height_filter(resolution);
    let (selector, label) = match format {
        OutputFormat::Mp3 => ("bestaudio/best".to_string(), "audio"),
        OutputFormat::Mp4WithoutAudio => (
            format!("bestvideo{f}/best{f}/best", f = filter),
            "video",
        ),
        _ if filter.is_empty() => ("best".to_string(), "av"),
        _ => (format!("best{}/best", filter), "av"),
    };

    PlannedStream {
        selector,
        label: label.to_string(),
        ext: info.ext.clone(),
        height: None,
        filesize: info.size_estimate(),
        kind: StreamKind::Combined,
    }
}

fn rate(descriptor: &FormatDescriptor) -> f64 {
    descriptor.tbr.or(descriptor.abr).unwrap_or(0.0)
}

fn pick_video<'a>(
    candidates: &[&'a FormatDescriptor],
    resolution: Resolution,
    prefer_ext: Option<&str>,
) -> Option<&'a FormatDescriptor> {
    if candidates.is_empty() {
        return None;
    }

    let mut heights: Vec<u32> = candidates.iter().filter_map(|f| f.height).collect();
    heights.sort_unstable();
    heights.dedup();

    let chosen_height = match resolution {
        _ if heights.is_empty() => None,
        Resolution::Best => heights.last().copied(),
        Resolution::MaxHeight(target) => nearest_height(&heights, target),
    };

    candidates
        .iter()
        .copied()
        .filter(|f| chosen_height.is_none() || f.height == chosen_height)
        .max_by(|a, b| {
            let ext_a = prefer_ext.is_some() && a.ext.as_deref() == prefer_ext;
            let ext_b = prefer_ext.is_some() && b.ext.as_deref() == prefer_ext;
            ext_a
                .cmp(&ext_b)
                .then(rate(a).total_cmp(&rate(b)))
                .then(a.size_estimate().cmp(&b.size_estimate()))
        })
}

fn pick_audio<'a>(
    candidates: &[&'a FormatDescriptor],
    bitrate: Option<u32>,
    prefer_ext: Option<&str>,
) -> Option<&'a FormatDescriptor> {
    let abr = |f: &FormatDescriptor| f.abr.or(f.tbr).unwrap_or(0.0);
    let ranked = |a: &&FormatDescriptor, b: &&FormatDescriptor| {
        abr(a).total_cmp(&abr(b)).then_with(|| {
            let ext_a = prefer_ext.is_some() && a.ext.as_deref() == prefer_ext;
            let ext_b = prefer_ext.is_some() && b.ext.as_deref() == prefer_ext;
            ext_a.cmp(&ext_b)
        })
    };

    match bitrate {
        None => candidates.iter().copied().max_by(ranked),
        Some(limit) => {
            let limit = f64::from(limit);
            candidates
                .iter()
                .copied()
                .filter(|f| abr(f) <= limit)
                .max_by(ranked)
                .or_else(|| {
                    candidates
                        .iter()
                        .copied()
                        .min_by(|a, b| abr(a).total_cmp(&abr(b)))
                })
        }
    }
}
