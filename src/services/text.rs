/// CJK Unified Ideographs block.
fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Split a mixed-language caption into its English and Chinese lines.
///
/// Lines containing any CJK ideograph go to the Chinese part, everything else
/// to the English part. Blank lines are dropped and each part keeps line order.
pub fn split_bilingual(text: &str) -> (String, String) {
    let mut english = Vec::new();
    let mut chinese = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.chars().any(is_cjk) {
            chinese.push(line);
        } else {
            english.push(line);
        }
    }

    (english.join("\n"), chinese.join("\n"))
}
