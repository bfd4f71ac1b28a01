use regex::Regex;
use std::sync::OnceLock;

/// Upstream JSON occasionally carries stringified JS sentinels; treat them as blank.
pub fn sanitize_sentinel(input: &str) -> &str {
    let t = input.trim();
    if t.eq_ignore_ascii_case("undefined") || t.eq_ignore_ascii_case("null") || t.eq_ignore_ascii_case("nan") {
        ""
    } else {
        input
    }
}

pub fn clamp_to_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

fn tag_regex() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static tag regex"))
}

/// Remove markup tags and decode the handful of entities scraped descriptions carry.
pub fn strip_html(input: &str) -> String {
    let without_tags = tag_regex().replace_all(input, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    collapse_whitespace(&decoded)
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold Latin diacritics to their base letters. Characters outside the table pass through.
pub fn fold_diacritics(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => out.push('a'),
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => out.push('A'),
            'æ' => out.push_str("ae"),
            'Æ' => out.push_str("AE"),
            'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => out.push('c'),
            'Ç' | 'Ć' | 'Č' | 'Ĉ' | 'Ċ' => out.push('C'),
            'ď' | 'đ' => out.push('d'),
            'Ď' | 'Đ' => out.push('D'),
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => out.push('e'),
            'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ĕ' | 'Ė' | 'Ę' | 'Ě' => out.push('E'),
            'ğ' | 'ĝ' | 'ġ' | 'ģ' => out.push('g'),
            'Ğ' | 'Ĝ' | 'Ġ' | 'Ģ' => out.push('G'),
            'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ĭ' | 'į' | 'ı' => out.push('i'),
            'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Ĭ' | 'Į' | 'İ' => out.push('I'),
            'ł' | 'ľ' | 'ĺ' | 'ļ' => out.push('l'),
            'Ł' | 'Ľ' | 'Ĺ' | 'Ļ' => out.push('L'),
            'ñ' | 'ń' | 'ň' | 'ņ' => out.push('n'),
            'Ñ' | 'Ń' | 'Ň' | 'Ņ' => out.push('N'),
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => out.push('o'),
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => out.push('O'),
            'œ' => out.push_str("oe"),
            'Œ' => out.push_str("OE"),
            'ŕ' | 'ř' => out.push('r'),
            'Ŕ' | 'Ř' => out.push('R'),
            'ś' | 'š' | 'ş' | 'ș' => out.push('s'),
            'Ś' | 'Š' | 'Ş' | 'Ș' => out.push('S'),
            'ß' => out.push_str("ss"),
            'ť' | 'ţ' | 'ț' => out.push('t'),
            'Ť' | 'Ţ' | 'Ț' => out.push('T'),
            'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => out.push('u'),
            'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ŭ' | 'Ů' | 'Ű' | 'Ų' => out.push('U'),
            'ý' | 'ÿ' => out.push('y'),
            'Ý' | 'Ÿ' => out.push('Y'),
            'ź' | 'ż' | 'ž' => out.push('z'),
            'Ź' | 'Ż' | 'Ž' => out.push('Z'),
            other => out.push(other),
        }
    }
    out
}

/// URL slug: diacritics folded, lowercase, non-alphanumeric runs collapsed to `-`.
pub fn slugify(input: &str) -> String {
    let folded = fold_diacritics(input);
    let mut slug = String::with_capacity(folded.len());
    let mut last_dash = false;
    for ch in folded.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Key used to compare attribute/feature names across sources and languages.
pub fn normalize_name(input: &str) -> String {
    let folded = fold_diacritics(input.trim()).to_lowercase();
    let spaced: String = folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced)
}
