//! HLS playlist reading
//!
//! Used on the consuming side of a synthesized manifest and by the
//! variant existence probe:
//! - multivariant playlists (stream-info + variant URI pairs)
//! - media playlists (segment count only)

use crate::{error::Error, types::Resolution, Result};

/// One `#EXT-X-STREAM-INF` entry of a multivariant playlist
#[derive(Debug, Clone, PartialEq)]
pub struct MasterEntry {
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub uri: String,
}

impl MasterEntry {
    /// Rendition name derived from the variant file stem (`.../720p.m3u8` -> `720p`)
    pub fn quality_name(&self) -> &str {
        let file = self.uri.rsplit('/').next().unwrap_or(&self.uri);
        file.split('.').next().unwrap_or(file)
    }
}

/// Read a multivariant playlist, preserving entry order
pub fn read_master(text: &str) -> Result<Vec<MasterEntry>> {
    // Blank separator lines carry no meaning in the format
    let mut compact: String = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    compact.push('\n');

    let parsed = m3u8_rs::parse_master_playlist_res(compact.as_bytes())
        .map_err(|e| Error::ManifestParse(format!("Failed to parse HLS master: {:?}", e)))?;

    if parsed.variants.is_empty() {
        return Err(Error::ManifestParse("HLS master has no variants".into()));
    }

    Ok(parsed
        .variants
        .iter()
        .map(|variant| MasterEntry {
            bandwidth: variant.bandwidth,
            resolution: variant.resolution.map(|r| Resolution {
                width: r.width as u32,
                height: r.height as u32,
            }),
            uri: variant.uri.clone(),
        })
        .collect())
}

/// Parse a media playlist and return its segment count
pub fn parse_media_playlist(content: &[u8]) -> Result<usize> {
    let parsed = m3u8_rs::parse_media_playlist_res(content)
        .map_err(|e| Error::ManifestParse(format!("Failed to parse HLS media: {:?}", e)))?;
    Ok(parsed.segments.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n#EXT-X-VERSION:3\n\n\
        #EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720\n\
        https://cdn.example.com/videos/m1/720p.m3u8\n\n\
        #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
        https://cdn.example.com/videos/m1/360p.m3u8\n\n";

    #[test]
    fn reads_master_in_order() {
        let entries = read_master(MASTER).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bandwidth, 2_800_000);
        assert_eq!(entries[0].resolution, Some(Resolution::HD_720P));
        assert_eq!(entries[0].quality_name(), "720p");
        assert_eq!(entries[1].quality_name(), "360p");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(read_master("not a playlist"), Err(Error::ManifestParse(_))));
    }

    #[test]
    fn counts_media_segments() {
        let media = b"#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n\
            #EXTINF:6.0,\nseg0.ts\n#EXTINF:6.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(parse_media_playlist(media).unwrap(), 2);
    }
}
