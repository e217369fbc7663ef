//! Request context extraction: device fingerprint from the User-Agent and
//! geo context from the edge proxy's `x-geo-*` headers.

use axum::http::HeaderMap;

use crate::models::{DeviceFingerprint, GeoLocation};

/// Coarse User-Agent parse. Matching is ordered: Edge and Opera embed
/// "Chrome", Chrome embeds "Safari".
pub fn fingerprint_from_user_agent(user_agent: &str) -> DeviceFingerprint {
    let ua = user_agent.to_ascii_lowercase();

    let browser = if ua.contains("edg/") || ua.contains("edge/") {
        "Edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("firefox/") {
        "Firefox"
    } else if ua.contains("chrome/") || ua.contains("crios/") {
        "Chrome"
    } else if ua.contains("safari/") {
        "Safari"
    } else {
        "Unknown"
    };

    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("iphone") || ua.contains("ipad") {
        "iOS"
    } else if ua.contains("mac os x") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Unknown"
    };

    let device_class = if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        "mobile"
    } else {
        "desktop"
    };

    DeviceFingerprint {
        browser: browser.to_string(),
        os: os.to_string(),
        device_class: device_class.to_string(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Client address as reported by the edge proxy. The first entry of
/// `x-forwarded-for` is the original client.
pub fn client_ip(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|chain| chain.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Geo context is resolved by the reverse proxy; the service trusts its
/// headers and degrades gracefully when they are absent.
pub fn geo_from_headers(headers: &HeaderMap) -> Option<GeoLocation> {
    let country = header_str(headers, "x-geo-country")?;
    let latitude = header_str(headers, "x-geo-lat").and_then(|s| s.parse().ok());
    let longitude = header_str(headers, "x-geo-lon").and_then(|s| s.parse().ok());
    Some(GeoLocation {
        country,
        city: header_str(headers, "x-geo-city"),
        region: header_str(headers, "x-geo-region"),
        latitude,
        longitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn desktop_firefox_on_linux() {
        let fp = fingerprint_from_user_agent(
            "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
        );
        assert_eq!(fp.browser, "Firefox");
        assert_eq!(fp.os, "Linux");
        assert_eq!(fp.device_class, "desktop");
    }

    #[test]
    fn edge_is_not_mistaken_for_chrome() {
        let fp = fingerprint_from_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0",
        );
        assert_eq!(fp.browser, "Edge");
        assert_eq!(fp.os, "Windows");
    }

    #[test]
    fn iphone_is_mobile() {
        let fp = fingerprint_from_user_agent(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
        );
        assert_eq!(fp.os, "iOS");
        assert_eq!(fp.device_class, "mobile");
    }

    #[test]
    fn geo_requires_country() {
        let mut headers = HeaderMap::new();
        headers.insert("x-geo-city", HeaderValue::from_static("Riyadh"));
        assert!(geo_from_headers(&headers).is_none());

        headers.insert("x-geo-country", HeaderValue::from_static("SA"));
        headers.insert("x-geo-lat", HeaderValue::from_static("24.7136"));
        headers.insert("x-geo-lon", HeaderValue::from_static("46.6753"));
        let geo = geo_from_headers(&headers).unwrap();
        assert_eq!(geo.country, "SA");
        assert_eq!(geo.city.as_deref(), Some("Riyadh"));
        assert_eq!(geo.latitude, Some(24.7136));
    }
}
