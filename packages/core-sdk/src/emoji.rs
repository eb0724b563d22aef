use once_cell::sync::Lazy;
use regex::Regex;

/// One emoji grapheme: flag pair, keycap, lone skin tone, or a pictograph with
/// its modifiers and ZWJ continuations.
static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"[\x{1F1E6}-\x{1F1FF}]{1,2}",
        r"|[0-9#*]\x{FE0F}?\x{20E3}",
        r"|\p{Extended_Pictographic}[\x{FE0F}\x{1F3FB}-\x{1F3FF}\x{E0020}-\x{E007F}]*",
        r"(?:\x{200D}\p{Extended_Pictographic}[\x{FE0F}\x{1F3FB}-\x{1F3FF}\x{E0020}-\x{E007F}]*)*",
        r"|[\x{1F3FB}-\x{1F3FF}]",
    ))
    .expect("emoji pattern is valid")
});

/**
 * \brief 折叠重复 emoji。
 * \param suppress_all 为 true 时删除全部 emoji；否则只删除紧贴在同一个 emoji 之后的重复项。
 */
pub fn collapse(text: &str, suppress_all: bool) -> String {
    if suppress_all {
        return strip_all(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut previous: Option<(&str, usize)> = None;
    for found in EMOJI.find_iter(text) {
        out.push_str(&text[last..found.start()]);
        let repeated = matches!(
            previous,
            Some((emoji, end)) if end == found.start() && emoji == found.as_str()
        );
        if !repeated {
            out.push_str(found.as_str());
        }
        // 位置按原文推进，连续多个相同 emoji 只保留第一个
        previous = Some((found.as_str(), found.end()));
        last = found.end();
    }
    out.push_str(&text[last..]);
    out
}

pub fn contains_emoji(text: &str) -> bool {
    EMOJI.is_match(text)
}

fn strip_all(text: &str) -> String {
    let mut current = EMOJI.replace_all(text, "").into_owned();
    // 删除后残留的数字与 keycap 可能重新拼成 emoji
    while EMOJI.is_match(&current) {
        current = EMOJI.replace_all(&current, "").into_owned();
    }
    current
}
