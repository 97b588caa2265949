//! 从运营的自然语言里找出要发的券，例如 "送 3000/98折 给这些店"。
//!
//! 这是一组按顺序执行的正则，不是语法分析；有歧义的输入可能静默匹配到错误的券。

use crate::models::SelectedCoupon;
use once_cell::sync::Lazy;
use regex::Regex;

/// 没写门槛的 "98折" 默认按 2000 门槛处理
pub const DEFAULT_THRESHOLD: &str = "2000";

/// 从文本里提取券描述（如 "3000/98折"），可替换成更严格的实现
pub trait KeywordExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;
}

static SLASH_DISCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{3,5})\s*[/／]\s*(\d{2})\s*折").unwrap());
static TIER_DISCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{3,5})\s*档\s*(\d{2})\s*折").unwrap());
static DASH_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{3,5})\s*[-－~～]\s*(\d{1,4})").unwrap());
static MINUS_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{3,5})\s*减\s*(\d{1,4})").unwrap());
static BARE_DISCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\d/／档.])(\d{2})\s*折").unwrap());
static BARE_NINETIES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\D)(9\d)(?:\D|$)").unwrap());
static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// 默认实现：固定顺序的一组正则
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexKeywordExtractor;

impl KeywordExtractor for RegexKeywordExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut consumed: Vec<(usize, usize)> = Vec::new();
        let mut push = |item: String| {
            if !found.contains(&item) {
                found.push(item);
            }
        };

        for caps in SLASH_DISCOUNT.captures_iter(text) {
            consumed.push(span(&caps));
            push(format!("{}/{}折", &caps[1], &caps[2]));
        }
        for caps in TIER_DISCOUNT.captures_iter(text) {
            consumed.push(span(&caps));
            push(format!("{}/{}折", &caps[1], &caps[2]));
        }
        for caps in DASH_AMOUNT.captures_iter(text) {
            let (start, end) = span(&caps);
            // 2026-10-18 这类日期
            if text[end..].starts_with(['-', '－', '/']) {
                continue;
            }
            consumed.push((start, end));
            push(format!("{}-{}", &caps[1], &caps[2]));
        }
        for caps in MINUS_AMOUNT.captures_iter(text) {
            consumed.push(span(&caps));
            push(format!("{}-{}", &caps[1], &caps[2]));
        }

        // 已被上面的写法识别的片段不再参与 "y折"
        let rest = mask(text, &consumed);
        for caps in BARE_DISCOUNT.captures_iter(&rest) {
            push(format!("{DEFAULT_THRESHOLD}/{}折", &caps[1]));
        }

        if found.is_empty() {
            // 最后兜底：孤立的 90-99 当作折扣
            if let Some(caps) = BARE_NINETIES.captures(text) {
                found.push(format!("{DEFAULT_THRESHOLD}/{}折", &caps[1]));
            }
        }
        found
    }
}

fn span(caps: &regex::Captures<'_>) -> (usize, usize) {
    caps.get(0).map(|m| (m.start(), m.end())).unwrap_or_default()
}

/// 把已识别的片段替换成等长空格，字节位置不变
fn mask(text: &str, spans: &[(usize, usize)]) -> String {
    let mut bytes = text.as_bytes().to_vec();
    for &(start, end) in spans {
        bytes[start..end].fill(b' ');
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

fn numbers(text: &str) -> Vec<u32> {
    NUMBERS
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// 关键字与描述是否指同一张券
///
/// 单个数字的关键字只和描述的第二个数字比较，也就是默认它是折扣/金额而不是门槛。
/// 这个约定没有拿真实关键字验证过，门槛写法的关键字会误配。
pub fn keyword_matches(keyword: &str, description: &str) -> bool {
    let kw = numbers(keyword);
    let desc = numbers(description);
    match (kw.as_slice(), desc.as_slice()) {
        ([a, b], [c, d]) => a == c && b == d,
        ([a], [_, d]) => a == d,
        _ => {
            let keyword = keyword.trim();
            !keyword.is_empty() && (keyword.contains(description) || description.contains(keyword))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchReport {
    pub matched: Vec<SelectedCoupon>,
    pub descriptions: Vec<String>,
    /// 没有匹配到任何券的描述
    pub unmatched: Vec<String>,
    pub available: Vec<String>,
}

impl MatchReport {
    /// 第一个没匹配上的描述 + 可用关键字，提示运营重试
    pub fn hint(&self) -> Option<String> {
        let first = self.unmatched.first()?;
        Some(format!(
            "未找到「{}」对应的共享券，可用关键字: {}",
            first,
            if self.available.is_empty() {
                "无".to_string()
            } else {
                self.available.join("、")
            }
        ))
    }
}

pub struct KeywordMatcher<E: KeywordExtractor = RegexKeywordExtractor> {
    extractor: E,
}

impl Default for KeywordMatcher {
    fn default() -> Self {
        Self::new(RegexKeywordExtractor)
    }
}

impl<E: KeywordExtractor> KeywordMatcher<E> {
    pub fn new(extractor: E) -> Self {
        Self { extractor }
    }

    pub fn match_keywords(&self, text: &str, candidates: &[SelectedCoupon]) -> MatchReport {
        let descriptions = self.extractor.extract(text);
        let mut report = MatchReport {
            available: candidates
                .iter()
                .map(|item| item.keyword.clone())
                .filter(|item| !item.trim().is_empty())
                .collect(),
            ..MatchReport::default()
        };

        for description in &descriptions {
            let mut hit = false;
            for candidate in candidates {
                if candidate.keyword.trim().is_empty()
                    || !keyword_matches(&candidate.keyword, description)
                {
                    continue;
                }
                hit = true;
                if !report.matched.iter().any(|item| item.id == candidate.id) {
                    report.matched.push(candidate.clone());
                }
            }
            if !hit {
                report.unmatched.push(description.clone());
            }
        }
        tracing::debug!(
            "关键字匹配: text={}, descriptions={:?}, matched={}",
            text,
            descriptions,
            report.matched.len()
        );
        report.descriptions = descriptions;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon(id: &str, keyword: &str) -> SelectedCoupon {
        SelectedCoupon {
            id: id.to_string(),
            keyword: keyword.to_string(),
            name: format!("券{id}"),
        }
    }

    #[test]
    fn slash_phrase_matches_exact_keyword() {
        let matcher = KeywordMatcher::default();
        let report = matcher.match_keywords("送3000/98折给这些店", &[coupon("1", "3000/98折")]);
        assert_eq!(report.matched, vec![coupon("1", "3000/98折")]);
        assert!(report.unmatched.is_empty());
    }

    #[test]
    fn bare_discount_defaults_threshold() {
        let matcher = KeywordMatcher::default();
        let report = matcher.match_keywords("99折活动", &[coupon("7", "2000/99折")]);
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.descriptions, vec!["2000/99折".to_string()]);
    }

    #[test]
    fn unrelated_text_matches_nothing() {
        let matcher = KeywordMatcher::default();
        let report = matcher.match_keywords("无关文字", &[coupon("1", "3000/98折")]);
        assert!(report.matched.is_empty());
        assert!(report.hint().is_none());
    }

    #[test]
    fn extractor_handles_each_phrasing() {
        let extractor = RegexKeywordExtractor;
        assert_eq!(extractor.extract("3000档97折"), vec!["3000/97折"]);
        assert_eq!(extractor.extract("满5000减200"), vec!["5000-200"]);
        assert_eq!(extractor.extract("5000-200 的券"), vec!["5000-200"]);
        assert_eq!(extractor.extract("来点 95 的"), vec!["2000/95折"]);
        // 已有明确描述时不走兜底
        assert_eq!(extractor.extract("3000/98折 93"), vec!["3000/98折"]);
        // 手机号里的数字不会被当作折扣
        assert!(extractor.extract("13800001111").is_empty());
    }

    #[test]
    fn single_number_keyword_compares_second_number() {
        assert!(keyword_matches("98折", "3000/98折"));
        assert!(!keyword_matches("3000", "3000/98折"));
        assert!(keyword_matches("3000-100", "3000-100"));
        assert!(!keyword_matches("2000/98折", "3000/98折"));
    }

    #[test]
    fn unmatched_description_reports_available_keywords() {
        let matcher = KeywordMatcher::default();
        let candidates = [coupon("1", "3000/98折"), coupon("2", "2000/99折")];
        let report = matcher.match_keywords("送 5000/90折 和 3000/98折", &candidates);
        assert_eq!(report.matched, vec![coupon("1", "3000/98折")]);
        assert_eq!(
            report.hint().unwrap(),
            "未找到「5000/90折」对应的共享券，可用关键字: 3000/98折、2000/99折"
        );
    }

    #[test]
    fn spaced_slash_does_not_add_default_threshold() {
        let extractor = RegexKeywordExtractor;
        assert_eq!(extractor.extract("送3000 / 98折给这些店"), vec!["3000/98折"]);
        assert_eq!(extractor.extract("3000档 98折"), vec!["3000/98折"]);
        assert_eq!(extractor.extract("3000／ 98 折"), vec!["3000/98折"]);

        let matcher = KeywordMatcher::default();
        let candidates = [coupon("A", "3000/98折"), coupon("B", "2000/98折")];
        let report = matcher.match_keywords("3000 / 98折", &candidates);
        assert_eq!(report.matched, vec![coupon("A", "3000/98折")]);
    }

    #[test]
    fn dates_and_store_ids_are_not_coupons() {
        let extractor = RegexKeywordExtractor;
        assert_eq!(
            extractor.extract("3000-100 有效期 2026-10-18 至 2026-12-31"),
            vec!["3000-100"]
        );
        assert!(extractor.extract("2026-10-18 到期").is_empty());
        assert!(extractor.extract("门店 S1095 和 13899990000").is_empty());

        let matcher = KeywordMatcher::default();
        let candidates = [coupon("A", "2026-10"), coupon("B", "3000-100")];
        let report = matcher.match_keywords("3000-100 截止 2026-10-18", &candidates);
        assert_eq!(report.matched, vec![coupon("B", "3000-100")]);
    }

    #[test]
    fn bare_discount_still_found_beside_other_phrasings() {
        let extractor = RegexKeywordExtractor;
        assert_eq!(
            extractor.extract("3000/98折 和 95折"),
            vec!["3000/98折", "2000/95折"]
        );
    }

    struct FixedExtractor;

    impl KeywordExtractor for FixedExtractor {
        fn extract(&self, _text: &str) -> Vec<String> {
            vec!["VIP".to_string()]
        }
    }

    #[test]
    fn extractor_is_pluggable() {
        let matcher = KeywordMatcher::new(FixedExtractor);
        let report = matcher.match_keywords("任意", &[coupon("9", "VIP专享")]);
        assert_eq!(report.matched.len(), 1);
    }
}
