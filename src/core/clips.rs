use crate::utils::format_clip_duration;
use super::types::{ClipPayload, ClipTemplate, GeneratedClip};

/// 将服务端返回的片段转换为本地片段列表，模板统一为默认值
pub fn build_clips(payloads: &[ClipPayload]) -> Vec<GeneratedClip> {
    payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| {
            let number = index + 1;
            GeneratedClip {
                id: format!("clip-{}", number),
                title: payload
                    .title
                    .as_deref()
                    .map(str::trim)
                    .filter(|title| !title.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| format!("Clip {}", number)),
                duration: format_clip_duration(payload.end_time - payload.start_time),
                thumbnail: payload.thumbnail_url.clone(),
                url: payload.url.clone(),
                template: ClipTemplate::default(),
            }
        })
        .collect()
}
