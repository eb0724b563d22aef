use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::dice::Dice;
use crate::emoji;
use crate::error::StreamError;
use crate::models::MessageId;
use crate::sink::OutputSink;
use crate::sse::StreamDelta;

/**
 * \brief 一次性模式：等待流结束，拼接全部增量。
 * \details 遇到第一个错误立即返回；结果做一次重复 emoji 折叠。
 */
pub async fn collect(mut rx: UnboundedReceiver<StreamDelta>) -> Result<String, StreamError> {
    let mut result = String::new();
    while let Some(delta) = rx.recv().await {
        match delta {
            StreamDelta::Text(text) => result.push_str(&text),
            StreamDelta::Error(err) => return Err(err),
            StreamDelta::Done => break,
        }
    }
    Ok(emoji::collapse(&result, false))
}

/**
 * \brief 分段模式的参数。
 */
#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions<'a> {
    /** \brief 断句符号，按优先级排列 */
    pub boundaries: &'a [String],
    /** \brief 断句时不随当前片段发出、保留到下一片段开头的符号 */
    pub non_consuming: &'a [String],
    /** \brief 需要引用回复的消息；仅随机一半的片段真正带引用 */
    pub reply_to: Option<MessageId>,
}

/**
 * \brief 拟人分段模式：边接收边按断句符号把片段推给 Sink。
 * \return 未经折叠的完整回复文本；出错时已发出的片段不撤回。
 */
pub async fn segment(
    mut rx: UnboundedReceiver<StreamDelta>,
    options: SegmentOptions<'_>,
    sink: &dyn OutputSink,
    dice: &mut dyn Dice,
) -> Result<String, StreamError> {
    let suppress_all = dice.flip();
    let mut buf = String::new();
    let mut result = String::new();

    while let Some(delta) = rx.recv().await {
        let text = match delta {
            StreamDelta::Text(text) => text,
            StreamDelta::Error(err) => return Err(err),
            StreamDelta::Done => break,
        };
        result.push_str(&text);
        buf.push_str(&text);
        buf = emoji::collapse(&buf, suppress_all);

        while let Some((fragment, rest)) = split_fragment(&buf, &options) {
            deliver(sink, dice, options.reply_to, &fragment);
            buf = rest;
        }
    }

    deliver(sink, dice, options.reply_to, &buf);
    Ok(result)
}

/// Splits at the first boundary (priority order) found past position 0.
/// A non-consuming symbol stays at the head of the remainder, where position 0 cannot split again.
fn split_fragment(buf: &str, options: &SegmentOptions<'_>) -> Option<(String, String)> {
    for symbol in options.boundaries {
        let Some((index, _)) = buf.match_indices(symbol.as_str()).find(|(i, _)| *i > 0) else {
            continue;
        };
        let end = if options.non_consuming.contains(symbol) {
            index
        } else {
            index + symbol.len()
        };
        return Some((buf[..end].to_string(), buf[end..].to_string()));
    }
    None
}

fn deliver(sink: &dyn OutputSink, dice: &mut dyn Dice, reply_to: Option<MessageId>, fragment: &str) {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return;
    }
    // 减少引用别人：只有一半片段带引用
    let reply_to = reply_to.filter(|_| dice.flip());
    debug!(len = fragment.len(), reply = reply_to.is_some(), "flush fragment");
    sink.send_maybe_replying(reply_to, fragment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::scripted::ScriptedDice;
    use crate::sink::{drain_events, ChannelSink, SinkEvent};
    use tokio::sync::mpsc;

    fn feed(deltas: Vec<StreamDelta>) -> UnboundedReceiver<StreamDelta> {
        let (tx, rx) = mpsc::unbounded_channel();
        for delta in deltas {
            tx.send(delta).expect("send delta");
        }
        rx
    }

    fn text(s: &str) -> StreamDelta {
        StreamDelta::Text(s.to_string())
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sent_texts(events: &[SinkEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Text { text, .. } | SinkEvent::Reply { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_collect_concatenates_in_order() {
        let rx = feed(vec![text("Hi"), text(" there."), StreamDelta::Done]);
        assert_eq!(collect(rx).await, Ok("Hi there.".to_string()));
    }

    #[tokio::test]
    async fn test_collect_returns_first_error() {
        let rx = feed(vec![
            text("partial"),
            StreamDelta::Error(StreamError::Upstream("boom".to_string())),
        ]);
        assert_eq!(
            collect(rx).await,
            Err(StreamError::Upstream("boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_collect_collapses_repeated_emoji() {
        let rx = feed(vec![text("ok😀"), text("😀😀 done")]);
        assert_eq!(collect(rx).await, Ok("ok😀 done".to_string()));
    }

    #[tokio::test]
    async fn test_segment_splits_on_period() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &[],
            reply_to: None,
        };
        let result = segment(feed(vec![text("Hello. World")]), options, &sink, &mut dice)
            .await
            .expect("segment");
        assert_eq!(result, "Hello. World");
        assert_eq!(sent_texts(&drain_events(&mut events)), vec!["Hello.", "World"]);
    }

    #[tokio::test]
    async fn test_segment_non_consuming_symbol_opens_next_fragment() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &boundaries,
            reply_to: None,
        };
        let result = segment(feed(vec![text("First. Second")]), options, &sink, &mut dice)
            .await
            .expect("segment");
        assert_eq!(result, "First. Second");
        assert_eq!(sent_texts(&drain_events(&mut events)), vec!["First", ". Second"]);
    }

    #[tokio::test]
    async fn test_segment_non_consuming_symbols_in_default_order() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["!", ".", "?", "！", "。", "？", "\n\n"]);
        let non_consuming = symbols(&[".", "。", "\n\n"]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &non_consuming,
            reply_to: None,
        };
        let deltas = vec![text("今天天气不错。"), text("出去走走吗？好"), text("呀")];
        segment(feed(deltas), options, &sink, &mut dice)
            .await
            .expect("segment");
        // 句号留在下一片段开头，开头位置不再触发断句
        assert_eq!(
            sent_texts(&drain_events(&mut events)),
            vec!["今天天气不错", "。出去走走吗？", "好呀"]
        );
    }

    #[tokio::test]
    async fn test_segment_carried_paragraph_break_is_trimmed() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["\n\n"]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &boundaries,
            reply_to: None,
        };
        let deltas = vec![text("第一段\n\n第二"), text("段\n\n"), text("第三段")];
        let result = segment(feed(deltas), options, &sink, &mut dice)
            .await
            .expect("segment");
        assert_eq!(result, "第一段\n\n第二段\n\n第三段");
        assert_eq!(
            sent_texts(&drain_events(&mut events)),
            vec!["第一段", "第二段", "第三段"]
        );
    }

    #[tokio::test]
    async fn test_segment_fragments_rebuild_text() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["!", "?", "."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &[],
            reply_to: None,
        };
        let deltas = vec![
            text("Wow! That"),
            text(" is great. Are"),
            text(" you sure? Yes"),
            text(" I am."),
        ];
        let result = segment(feed(deltas), options, &sink, &mut dice)
            .await
            .expect("segment");
        let rebuilt: String = sent_texts(&drain_events(&mut events)).concat();
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&rebuilt), strip(&result));
    }

    #[tokio::test]
    async fn test_segment_reply_annotation_follows_dice() {
        let (sink, mut events) = ChannelSink::new();
        // 第一次抛硬币决定是否删除全部 emoji，之后每个片段一次
        let mut dice = ScriptedDice::new(&[false, true, false], &[]);
        let boundaries = symbols(&["."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &[],
            reply_to: Some(55),
        };
        segment(feed(vec![text("One. Two.")]), options, &sink, &mut dice)
            .await
            .expect("segment");
        let events = drain_events(&mut events);
        assert!(matches!(&events[0], SinkEvent::Reply { reply_to: 55, text, .. } if text == "One."));
        assert!(matches!(&events[1], SinkEvent::Text { text, .. } if text == "Two."));
    }

    #[tokio::test]
    async fn test_segment_error_keeps_flushed_fragments() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::default();
        let boundaries = symbols(&["."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &[],
            reply_to: None,
        };
        let deltas = vec![
            text("First. Sec"),
            StreamDelta::Error(StreamError::Parse("bad frame".to_string())),
        ];
        let outcome = segment(feed(deltas), options, &sink, &mut dice).await;
        assert_eq!(outcome, Err(StreamError::Parse("bad frame".to_string())));
        assert_eq!(sent_texts(&drain_events(&mut events)), vec!["First."]);
    }

    #[tokio::test]
    async fn test_segment_suppresses_emoji_when_dice_says_so() {
        let (sink, mut events) = ChannelSink::new();
        let mut dice = ScriptedDice::new(&[true], &[]);
        let boundaries = symbols(&["."]);
        let options = SegmentOptions {
            boundaries: &boundaries,
            non_consuming: &[],
            reply_to: None,
        };
        let result = segment(feed(vec![text("Nice😀😀. Bye🙃")]), options, &sink, &mut dice)
            .await
            .expect("segment");
        assert_eq!(result, "Nice😀😀. Bye🙃");
        assert_eq!(sent_texts(&drain_events(&mut events)), vec!["Nice.", "Bye"]);
    }
}
