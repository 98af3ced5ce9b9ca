use serde::Serialize;

/// Platforms the cache distinguishes between. Two different platforms can
/// reuse the same native video id, so the platform is part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    YoutubeShorts,
    Tiktok,
    Instagram,
    Vkontakte,
    Twitter,
    Facebook,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::YoutubeShorts => "youtube_shorts",
            Self::Tiktok => "tiktok",
            Self::Instagram => "instagram",
            Self::Vkontakte => "vkontakte",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Other => "other",
        }
    }
}

/// The `(resource_id, platform)` half of the cache composite key, derived
/// deterministically from a source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub resource_id: String,
    pub platform: Platform,
}

/// Maps a source URL to its cache identity. Pure and deterministic: the
/// same URL always yields the same identity for the lifetime of the cache.
/// Unrecognized hosts hash the normalized URL so any extractor-supported
/// link still gets a stable cache row.
pub fn derive(source_url: &str) -> ResourceIdentity {
    let url = source_url.trim();

    let rules: &[(Platform, &str, fn(char) -> bool)] = &[
        (Platform::YoutubeShorts, "youtube.com/shorts/", is_youtube_id_char),
        (Platform::Youtube, "youtube.com/watch?v=", is_youtube_id_char),
        (Platform::Youtube, "youtube.com/embed/", is_youtube_id_char),
        (Platform::Youtube, "youtube.com/v/", is_youtube_id_char),
        (Platform::Youtube, "youtu.be/", is_youtube_id_char),
        (Platform::Tiktok, "vm.tiktok.com/", char::is_alphanumeric),
        (Platform::Tiktok, "tiktok.com/t/", char::is_alphanumeric),
        (Platform::Instagram, "instagram.com/p/", is_slug_char),
        (Platform::Instagram, "instagram.com/reel/", is_slug_char),
        (Platform::Instagram, "instagram.com/tv/", is_slug_char),
        (Platform::Vkontakte, "vk.com/videos", is_vk_id_char),
        (Platform::Vkontakte, "vk.com/video", is_vk_id_char),
        (Platform::Facebook, "fb.watch/", is_slug_char),
    ];

    for (platform, marker, accept) in rules {
        if let Some(id) = capture_after(url, marker, *accept) {
            return ResourceIdentity {
                resource_id: id,
                platform: *platform,
            };
        }
    }

    // Patterns with a path segment between the host and the id.
    if url.contains("tiktok.com/@") {
        if let Some(id) = capture_after(url, "/video/", |c| c.is_ascii_digit()) {
            return ResourceIdentity {
                resource_id: id,
                platform: Platform::Tiktok,
            };
        }
    }
    if url.contains("twitter.com/") || url.contains("x.com/") {
        if let Some(id) = capture_after(url, "/status/", |c| c.is_ascii_digit()) {
            return ResourceIdentity {
                resource_id: id,
                platform: Platform::Twitter,
            };
        }
    }
    if url.contains("facebook.com/") {
        if let Some(id) = capture_after(url, "/videos/", |c| c.is_ascii_digit()) {
            return ResourceIdentity {
                resource_id: id,
                platform: Platform::Facebook,
            };
        }
    }

    ResourceIdentity {
        resource_id: format!("u{:016x}", fnv1a64(normalize(url).as_bytes())),
        platform: Platform::Other,
    }
}

fn is_youtube_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_slug_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_vk_id_char(c: char) -> bool {
    c.is_ascii_digit() || c == '_' || c == '-'
}

/// Returns the run of accepted characters that follows `marker`, or None
/// when the marker is absent or immediately followed by a delimiter.
fn capture_after(url: &str, marker: &str, accept: fn(char) -> bool) -> Option<String> {
    let start = url.find(marker)? + marker.len();
    let id: String = url[start..].chars().take_while(|c| accept(*c)).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn normalize(url: &str) -> String {
    let lowered = url.to_ascii_lowercase();
    let stripped = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    stripped
        .strip_prefix("www.")
        .unwrap_or(stripped)
        .trim_end_matches('/')
        .to_string()
}

// FNV-1a, kept inline so hashed identities survive toolchain upgrades.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
