//! 支持上传给模型的图片 MIME 类型。

use std::fmt;

/// 受支持的图片类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageMime {
    Jpeg,
    Png,
    Webp,
}

impl ImageMime {
    /// 解析外部声明的 MIME 字符串（忽略大小写与参数部分）。
    ///
    /// 返回 `None` 表示不在支持范围内。
    pub fn parse(value: &str) -> Option<Self> {
        let base = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match base.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    /// 通过文件签名（magic bytes）识别类型。
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        let kind = infer::get(bytes)?;
        if kind.matcher_type() != infer::MatcherType::Image {
            return None;
        }
        Self::parse(kind.mime_type())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub(crate) fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
            Self::Webp => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ImageMime;

    #[test]
    fn parse_accepts_aliases_and_parameters() {
        assert_eq!(ImageMime::parse("IMAGE/JPG"), Some(ImageMime::Jpeg));
        assert_eq!(ImageMime::parse("image/png; charset=binary"), Some(ImageMime::Png));
        assert_eq!(ImageMime::parse("image/gif"), None);
        assert_eq!(ImageMime::parse(""), None);
    }

    #[test]
    fn sniff_recognizes_png_signature() {
        let png_signature = [137_u8, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13];
        assert_eq!(ImageMime::sniff(&png_signature), Some(ImageMime::Png));
    }

    #[test]
    fn sniff_rejects_non_image_payload() {
        assert_eq!(ImageMime::sniff(b"<html><body>not an image</body></html>"), None);
    }
}
