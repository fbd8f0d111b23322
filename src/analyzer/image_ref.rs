//! 画像参照の解決
//!
//! ページから抽出した `src` は `//cdn...` や `/images/...` のような相対形式の
//! ことがあるため、設定されたオリジンを基準に絶対URLへ変換します。

use url::Url;

use crate::error::FetchError;

/// 相対参照の基準となるデフォルトのオリジン
pub const DEFAULT_ORIGIN: &str = "https://with.is";

/// 画像参照 → 絶対URL
#[derive(Debug, Clone)]
pub struct ImageRefResolver {
    origin: Url,
}

impl ImageRefResolver {
    pub fn new(origin: &str) -> Result<Self, FetchError> {
        let origin = Url::parse(origin).map_err(|e| FetchError::InvalidUrl {
            reference: origin.to_string(),
            reason: format!("invalid origin: {}", e),
        })?;
        if origin.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl {
                reference: origin.to_string(),
                reason: "origin cannot be used as a base URL".to_string(),
            });
        }
        Ok(Self { origin })
    }

    /// 参照を解決する
    ///
    /// - `//host/path`: オリジンのスキームを付与
    /// - `/path`: オリジンのホストに連結
    /// - それ以外: 絶対URLとして解釈できなければエラー
    pub fn resolve(&self, reference: &str) -> Result<Url, FetchError> {
        let reference = reference.trim();
        let invalid = |reason: String| FetchError::InvalidUrl {
            reference: reference.to_string(),
            reason,
        };

        if reference.is_empty() {
            return Err(invalid("empty reference".to_string()));
        }

        let url = if reference.starts_with('/') {
            // "//" と "/" のどちらも基準URLとの結合で正しく解決される
            self.origin.join(reference).map_err(|e| invalid(e.to_string()))?
        } else {
            Url::parse(reference).map_err(|e| invalid(e.to_string()))?
        };

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid(format!("unsupported scheme '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_relative_takes_origin_scheme() {
        let resolver = ImageRefResolver::new(DEFAULT_ORIGIN).unwrap();
        let url = resolver.resolve("//cdn.example.com/img/a.jpg").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/img/a.jpg");
    }

    #[test]
    fn site_relative_joins_origin() {
        let resolver = ImageRefResolver::new(DEFAULT_ORIGIN).unwrap();
        let url = resolver.resolve("/photos/12.png?w=300").unwrap();
        assert_eq!(url.as_str(), "https://with.is/photos/12.png?w=300");
    }

    #[test]
    fn absolute_url_is_kept() {
        let resolver = ImageRefResolver::new("http://localhost:8080").unwrap();
        let url = resolver.resolve("https://images.example.org/x.jpeg").unwrap();
        assert_eq!(url.as_str(), "https://images.example.org/x.jpeg");
    }

    #[test]
    fn custom_origin_is_used_for_relative_refs() {
        let resolver = ImageRefResolver::new("http://localhost:8080").unwrap();
        let url = resolver.resolve("/a.jpg").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/a.jpg");
    }

    #[test]
    fn unparseable_references_are_invalid() {
        let resolver = ImageRefResolver::new(DEFAULT_ORIGIN).unwrap();
        for reference in ["", "images/a.jpg", "not a url", "data:image/png;base64,AAAA"] {
            let err = resolver.resolve(reference).unwrap_err();
            assert!(
                matches!(err, FetchError::InvalidUrl { .. }),
                "{:?} should be invalid",
                reference
            );
        }
    }

    #[test]
    fn invalid_origin_is_rejected() {
        assert!(ImageRefResolver::new("with.is").is_err());
    }
}
