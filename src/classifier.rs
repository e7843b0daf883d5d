//! Pure functions over payload bytes and advertised MIME types. Nothing here
//! touches the transport or the store.

use bytes::Bytes;
use chrono::Utc;

use crate::model::{
    BAD_TEXT_TYPES, CANONICAL_TEXT_TYPES, MimePayload, SNIPPET_SIZE, THUMBNAIL_HEIGHT,
    THUMBNAIL_WIDTH, UTF8_TEXT_ALIASES,
};

/// Sniff a payload's exact MIME type from its magic bytes. Falls back to
/// `application/octet-stream` when nothing matches, mirroring libmagic's
/// default for unrecognized binary data.
pub fn find_exact_type(bytes: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"RIFF", "image/webp"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
    ];

    for (magic, mime) in SIGNATURES {
        if bytes.starts_with(magic) {
            return mime;
        }
    }

    if is_text_by_encoding(bytes) {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// True iff the byte buffer decodes as UTF-8 or plain ASCII. Stands in for
/// libmagic's `MAGIC_MIME_ENCODING`, whose contract reduces to "encoding name
/// begins with `utf-` or `us-`".
pub fn is_text_by_encoding(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    std::str::from_utf8(bytes).is_ok()
}

/// True for the two MIME strings that are always treated as UTF-8 text
/// outright, regardless of content sniffing.
pub fn is_utf8_text(mime: &str) -> bool {
    UTF8_TEXT_ALIASES.contains(&mime)
}

/// True for any `text/*` MIME type (minus the known-bad set) and the legacy
/// `TEXT`/`STRING` aliases.
pub fn is_explicit_text(mime: &str) -> bool {
    if BAD_TEXT_TYPES.iter().any(|bad| mime.starts_with(bad)) {
        return false;
    }
    mime.starts_with("text/") || mime == "TEXT" || mime == "STRING"
}

/// True for any `image/*` MIME type.
pub fn is_image(mime: &str) -> bool {
    mime.starts_with("image/")
}

/// If the first payload looks textual by any predicate, republish it under
/// the five canonical text aliases (sharing the same byte buffer); otherwise
/// keep only the sniffed exact type for that payload.
pub fn guess_mime_types(payloads: &[MimePayload]) -> Vec<MimePayload> {
    let Some(first) = payloads.first() else {
        return Vec::new();
    };

    let exact = find_exact_type(&first.bytes);
    if is_text_by_encoding(&first.bytes) || is_utf8_text(exact) || is_explicit_text(exact) {
        CANONICAL_TEXT_TYPES
            .iter()
            .map(|ty| MimePayload::new(*ty, first.bytes.clone()))
            .collect()
    } else {
        vec![MimePayload::new(exact, first.bytes.clone())]
    }
}

/// Index of the payload to write out or snippet from: UTF-8 text beats
/// explicit text beats encoding-detected text beats any binary payload. Ties
/// at the same priority are broken by the last match.
pub fn find_write_type(payloads: &[MimePayload]) -> Option<usize> {
    let (mut utf8, mut explicit, mut any_text, mut binary) = (None, None, None, None);

    for (i, p) in payloads.iter().enumerate() {
        if is_utf8_text(&p.mime_type) {
            utf8 = Some(i);
        } else if is_explicit_text(&p.mime_type) {
            explicit = Some(i);
        } else if is_text_by_encoding(&p.bytes) {
            any_text = Some(i);
        } else {
            binary = Some(i);
        }
    }

    utf8.or(explicit).or(any_text).or(binary)
}

fn is_textual(payload: &MimePayload) -> bool {
    is_utf8_text(&payload.mime_type)
        || is_explicit_text(&payload.mime_type)
        || is_text_by_encoding(&payload.bytes)
}

/// Build an at-most-80-byte single-line snippet from the write-type payload,
/// replacing newlines with `\` and dropping embedded NULs. If no textual
/// payload exists, the snippet is a timestamp (`asctime`-style) followed by
/// the first MIME type, so a snippet is never empty.
pub fn get_snippet(payloads: &[MimePayload]) -> String {
    let write_type = find_write_type(payloads);

    let textual = write_type.map(|i| &payloads[i]).filter(|p| is_textual(p));

    match textual {
        Some(payload) => {
            let mut buf = Vec::with_capacity(SNIPPET_SIZE);
            for &byte in payload.bytes.iter() {
                if buf.len() >= SNIPPET_SIZE - 1 {
                    break;
                }
                match byte {
                    b'\n' => buf.push(b'\\'),
                    0 => {}
                    b => buf.push(b),
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        }
        None => {
            let stamp = Utc::now().format("%a %b %e %T %Y").to_string();
            let ty = payloads.first().map(|p| p.mime_type.as_str()).unwrap_or("");
            format!("{stamp} {ty}")
        }
    }
}

/// Generate a 320x100 fit-contain JPEG thumbnail of the largest image
/// payload, if any. Returns `None` (not an error) when there is no image
/// payload; a decode failure is reported as `Err` so the caller can log it
/// and store the entry without a thumbnail.
pub fn get_thumbnail(payloads: &[MimePayload]) -> Result<Option<Bytes>, String> {
    let Some((_, payload)) = payloads
        .iter()
        .enumerate()
        .filter(|(_, p)| is_image(&p.mime_type))
        .max_by_key(|(_, p)| p.bytes.len())
    else {
        return Ok(None);
    };

    let source = image::load_from_memory(&payload.bytes)
        .map_err(|e| format!("decode failed for {}: {e}", payload.mime_type))?
        .to_rgba8();
    let (src_w, src_h) = source.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err("zero-sized image".to_string());
    }

    let scale = (THUMBNAIL_WIDTH as f32 / src_w as f32).min(THUMBNAIL_HEIGHT as f32 / src_h as f32);
    let dst_w = ((src_w as f32 * scale).round() as u32).max(1);
    let dst_h = ((src_h as f32 * scale).round() as u32).max(1);

    use fast_image_resize as fir;
    let src_image = fir::images::Image::from_vec_u8(
        src_w,
        src_h,
        source.into_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|e| e.to_string())?;
    let mut dst_image = fir::images::Image::new(dst_w, dst_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let options =
        fir::ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| e.to_string())?;

    let thumbnail = image::RgbaImage::from_raw(dst_image.width(), dst_image.height(), dst_image.into_vec())
        .ok_or_else(|| "resized buffer size mismatch".to_string())?;

    let mut buffer = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(thumbnail)
        .write_to(&mut buffer, image::ImageFormat::Jpeg)
        .map_err(|e| e.to_string())?;

    Ok(Some(Bytes::from(buffer.into_inner())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_string_is_utf8_text() {
        assert!(is_utf8_text("UTF8_STRING"));
        assert!(is_utf8_text("text/plain;charset=utf-8"));
        assert!(!is_utf8_text("text/plain"));
    }

    #[test]
    fn bad_text_types_are_rejected() {
        assert!(!is_explicit_text("text/_moz_htmlinfo"));
        assert!(!is_explicit_text("text/ico"));
        assert!(is_explicit_text("text/html"));
        assert!(is_explicit_text("TEXT"));
    }

    #[test]
    fn guess_mime_types_republishes_text_under_five_aliases() {
        let payloads = vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"hello"))];
        let guessed = guess_mime_types(&payloads);
        assert_eq!(guessed.len(), 5);
        for p in &guessed {
            assert_eq!(p.bytes.as_ref(), b"hello");
        }
        assert_eq!(guessed[2].mime_type, "UTF8_STRING");
    }

    #[test]
    fn guess_mime_types_keeps_single_sniffed_type_for_binary() {
        let png_magic = b"\x89PNG\r\n\x1a\nrestofdata";
        let payloads = vec![MimePayload::new("image/png", Bytes::copy_from_slice(png_magic))];
        let guessed = guess_mime_types(&payloads);
        assert_eq!(guessed.len(), 1);
        assert_eq!(guessed[0].mime_type, "image/png");
    }

    #[test]
    fn snippet_replaces_newlines_and_does_not_truncate_short_text() {
        let payloads = vec![MimePayload::new(
            "UTF8_STRING",
            Bytes::from_static(b"hello\nworld"),
        )];
        assert_eq!(get_snippet(&payloads), "hello\\world");
    }

    #[test]
    fn snippet_truncates_at_79_bytes() {
        let long = "a".repeat(200);
        let payloads = vec![MimePayload::new("text/plain", Bytes::from(long))];
        let snippet = get_snippet(&payloads);
        assert_eq!(snippet.len(), SNIPPET_SIZE - 1);
    }

    #[test]
    fn snippet_falls_back_to_timestamp_and_type_for_binary() {
        let payloads = vec![MimePayload::new(
            "application/octet-stream",
            Bytes::from_static(&[0u8, 1, 2, 255]),
        )];
        let snippet = get_snippet(&payloads);
        assert!(snippet.ends_with("application/octet-stream"));
        assert!(!snippet.is_empty());
    }

    #[test]
    fn find_write_type_prefers_utf8_over_binary() {
        let payloads = vec![
            MimePayload::new("application/octet-stream", Bytes::from_static(&[1, 2, 3])),
            MimePayload::new("UTF8_STRING", Bytes::from_static(b"hi")),
        ];
        assert_eq!(find_write_type(&payloads), Some(1));
    }

    #[test]
    fn find_write_type_breaks_ties_with_last_match() {
        let payloads = vec![
            MimePayload::new("TEXT", Bytes::from_static(b"a")),
            MimePayload::new("STRING", Bytes::from_static(b"b")),
        ];
        assert_eq!(find_write_type(&payloads), Some(1));
    }

    #[test]
    fn no_thumbnail_without_image_payload() {
        let payloads = vec![MimePayload::new("text/plain", Bytes::from_static(b"hi"))];
        assert_eq!(get_thumbnail(&payloads).unwrap(), None);
    }
}
