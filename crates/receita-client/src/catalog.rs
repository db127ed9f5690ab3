//! Scraping of the publisher index page into a [`Release`].

use receita_core::config::PublisherConfig;
use receita_core::error::AppError;
use receita_core::models::{FileEntry, Release};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use tracing::warn;
use url::Url;

/// Builds the release described by an index page.
///
/// The last-update token is the first match of the timestamp pattern after
/// the anchor text, searched in the raw markup so tags between the two do not
/// matter. Archives are the `.zip` links of the page, resolved against
/// `base_url`, in first-seen order without duplicates.
///
/// # Errors
///
/// Returns `AppError::CatalogUnavailable` if the anchor or the token is
/// missing, or if the configured pattern is not a valid regular expression.
///
/// # Examples
///
/// ```
/// use receita_client::catalog::parse_release;
/// use receita_core::config::PublisherConfig;
/// use url::Url;
///
/// let html = r#"<p>Atualizado em <b>12/03/2024</b></p>
///     <a href="Empresas0.zip">Empresas0.zip</a>"#;
/// let base = Url::parse("https://dados.example.org/cnpj/").unwrap();
/// let release = parse_release(html, &base, &PublisherConfig::default()).unwrap();
///
/// assert_eq!(release.last_update, "12/03/2024");
/// assert_eq!(release.entries[0].url, "https://dados.example.org/cnpj/Empresas0.zip");
/// assert_eq!(release.entries[0].record_type, "EMPRESAS");
/// ```
pub fn parse_release(
    html: &str,
    base_url: &Url,
    config: &PublisherConfig,
) -> Result<Release, AppError> {
    let last_update = extract_timestamp(html, config)?;
    let entries = extract_archives(html, base_url);
    Ok(Release {
        last_update,
        entries,
    })
}

fn extract_timestamp(html: &str, config: &PublisherConfig) -> Result<String, AppError> {
    let pattern = Regex::new(&config.timestamp_pattern).map_err(|e| {
        AppError::CatalogUnavailable(format!("invalid timestamp pattern: {}", e))
    })?;

    let start = html.find(&config.timestamp_anchor).ok_or_else(|| {
        AppError::CatalogUnavailable(format!(
            "anchor {:?} not found on the index page",
            config.timestamp_anchor
        ))
    })?;
    let after = &html[start + config.timestamp_anchor.len()..];

    pattern
        .find(after)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            AppError::CatalogUnavailable(format!(
                "no last-update token after {:?}",
                config.timestamp_anchor
            ))
        })
}

fn extract_archives(html: &str, base_url: &Url) -> Vec<FileEntry> {
    let document = Html::parse_document(html);
    let Ok(links) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen: HashMap<String, String> = HashMap::new();
    let mut entries = Vec::new();

    for element in document.select(&links) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(url) = base_url.join(href.trim()) else {
            continue;
        };
        let Some(name) = archive_name(&url) else {
            continue;
        };
        // Staging paths and ledger keys are derived from the name.
        match seen.get(&name) {
            None => {
                seen.insert(name.clone(), url.to_string());
                entries.push(FileEntry::new(name, url.to_string()));
            }
            Some(first) if first.as_str() != url.as_str() => {
                warn!("Ignoring {}: {} is already listed at {}", url, name, first);
            }
            Some(_) => {}
        }
    }

    entries
}

/// Last path segment of `url` if it names a zip archive.
fn archive_name(url: &Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    let is_zip = name.len() > 4
        && name.is_char_boundary(name.len() - 4)
        && name[name.len() - 4..].eq_ignore_ascii_case(".zip");
    is_zip.then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
<html><body>
  <div class="documentByLine">
    <span class="documentModified">Atualizado em <span class="value">12/03/2024 18h04</span></span>
  </div>
  <p>Publicado em 01/01/2020</p>
  <ul>
    <li><a href="http://200.152.38.155/CNPJ/Empresas0.zip">Empresas0.zip</a></li>
    <li><a href="http://200.152.38.155/CNPJ/Estabelecimentos9.ZIP">Estabelecimentos9</a></li>
    <li><a href="http://200.152.38.155/CNPJ/Empresas0.zip">again</a></li>
    <li><a href="/CNPJ/Simples.zip">Simples</a></li>
    <li><a href="http://200.152.38.155/CNPJ/LAYOUT_DADOS_ABERTOS_CNPJ.pdf">layout</a></li>
    <li><a href="http://200.152.38.155/CNPJ/">directory</a></li>
    <li><a>no href</a></li>
  </ul>
</body></html>"#;

    fn base() -> Url {
        Url::parse("https://www.gov.br/receitafederal/dados-publicos-cnpj").unwrap()
    }

    #[test]
    fn test_parse_release() {
        let release = parse_release(INDEX, &base(), &PublisherConfig::default()).unwrap();
        assert_eq!(release.last_update, "12/03/2024");

        let names: Vec<&str> = release.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Empresas0.zip", "Estabelecimentos9.ZIP", "Simples.zip"]
        );
        assert_eq!(release.entries[1].record_type, "ESTABELECIMENTOS");
        assert_eq!(
            release.entries[2].url,
            "https://www.gov.br/CNPJ/Simples.zip"
        );
    }

    #[test]
    fn test_missing_anchor_is_catalog_unavailable() {
        let result = parse_release(
            "<p>Publicado em 01/01/2020</p>",
            &base(),
            &PublisherConfig::default(),
        );
        assert!(matches!(result, Err(AppError::CatalogUnavailable(_))));
    }

    #[test]
    fn test_anchor_without_token_is_catalog_unavailable() {
        let result = parse_release(
            "<p>Atualizado em breve</p>",
            &base(),
            &PublisherConfig::default(),
        );
        assert!(matches!(result, Err(AppError::CatalogUnavailable(_))));
    }

    #[test]
    fn test_release_without_archives() {
        let release = parse_release(
            "<p>Atualizado em 05/04/2024</p>",
            &base(),
            &PublisherConfig::default(),
        )
        .unwrap();
        assert_eq!(release.last_update, "05/04/2024");
        assert!(release.entries.is_empty());
    }

    #[test]
    fn test_custom_anchor_and_pattern() {
        let config = PublisherConfig {
            timestamp_anchor: "Last update:".to_string(),
            timestamp_pattern: r"\d{4}-\d{2}-\d{2}".to_string(),
            ..PublisherConfig::default()
        };
        let release = parse_release(
            "<p>Last update: <time>2024-05-12</time></p>",
            &base(),
            &config,
        )
        .unwrap();
        assert_eq!(release.last_update, "2024-05-12");
    }

    #[test]
    fn test_invalid_pattern_is_catalog_unavailable() {
        let config = PublisherConfig {
            timestamp_pattern: "(".to_string(),
            ..PublisherConfig::default()
        };
        let result = parse_release("<p>Atualizado em 05/04/2024</p>", &base(), &config);
        assert!(matches!(result, Err(AppError::CatalogUnavailable(_))));
    }

    #[test]
    fn test_same_name_at_two_urls_keeps_first() {
        let html = r#"<p>Atualizado em 12/03/2024</p>
<a href="http://mirror-a/CNPJ/Cnaes.zip">a</a>
<a href="http://mirror-b/CNPJ/Cnaes.zip">b</a>"#;
        let release = parse_release(html, &base(), &PublisherConfig::default()).unwrap();
        assert_eq!(release.entries.len(), 1);
        assert_eq!(release.entries[0].url, "http://mirror-a/CNPJ/Cnaes.zip");
    }

    #[test]
    fn test_archive_name() {
        let url = Url::parse("http://host/a/Cnaes.zip?x=1").unwrap();
        assert_eq!(archive_name(&url).as_deref(), Some("Cnaes.zip"));
        assert_eq!(archive_name(&Url::parse("http://host/a/.zip").unwrap()), None);
        assert_eq!(archive_name(&Url::parse("http://host/a/").unwrap()), None);
    }
}
