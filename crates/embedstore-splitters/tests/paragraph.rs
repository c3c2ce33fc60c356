use std::collections::HashMap;

use embedstore_splitters::{Document, ParagraphSplitter, TextSplitter, INDEX_METADATA_KEY};
use serde_json::json;

#[test]
fn empty_input_has_no_chunks() {
    let splitter = ParagraphSplitter::new(100, 10);
    assert!(splitter.split_text("").is_empty());
    assert!(splitter.split_text("\n\n  \n\n").is_empty());
}

#[test]
fn short_paragraphs_are_packed_together() {
    let splitter = ParagraphSplitter::new(100, 0);
    let result = splitter.split_text("first paragraph\n\nsecond paragraph");
    assert_eq!(result, vec!["first paragraph\n\nsecond paragraph"]);
}

#[test]
fn crlf_blank_lines_separate_paragraphs() {
    let splitter = ParagraphSplitter::new(12, 0);
    let result = splitter.split_text("one two\r\n\r\nthree four");
    assert_eq!(result, vec!["one two", "three four"]);
}

#[test]
fn overlap_repeats_the_previous_tail() {
    let splitter = ParagraphSplitter::new(12, 4);
    let result = splitter.split_text("aaa bbb ccc\n\nddd eee");
    assert_eq!(result, vec!["aaa bbb ccc", "ccc ddd eee"]);
}

#[test]
fn long_words_are_cut() {
    let splitter = ParagraphSplitter::new(4, 0);
    let result = splitter.split_text("abcdefghij");
    assert_eq!(result, vec!["abcd", "efgh", "ij"]);
}

#[test]
fn every_chunk_respects_the_budget() {
    let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod \
                tempor incididunt ut labore et dolore magna aliqua.\n\nUt enim ad minim \
                veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea \
                commodo consequat.\n\nDuis aute irure dolor in reprehenderit.";
    let splitter = ParagraphSplitter::new(40, 10);
    let result = splitter.split_text(text);

    assert!(result.len() > 3);
    for chunk in &result {
        assert!(chunk.chars().count() <= 40, "chunk too long: {chunk:?}");
        assert!(!chunk.trim().is_empty());
    }
    for word in ["Lorem", "aliqua.", "veniam,", "consequat.", "reprehenderit."] {
        assert!(result.iter().any(|c| c.contains(word)), "missing {word}");
    }
}

#[test]
fn split_documents_adds_index_and_keeps_metadata() {
    let mut metadata = HashMap::new();
    metadata.insert("source".to_string(), json!("notes.txt"));
    let doc = Document::with_metadata("notes", "one two\n\nthree four", metadata);

    let chunks = ParagraphSplitter::new(10, 0).split_documents(vec![doc]);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].id, "notes-0");
    assert_eq!(chunks[1].content, "three four");
    assert_eq!(chunks[1].metadata[INDEX_METADATA_KEY], json!(1));
    assert_eq!(chunks[1].metadata["source"], json!("notes.txt"));
}

#[test]
#[should_panic(expected = "overlap_chars must be < max_segment_chars")]
fn overlap_must_be_smaller_than_budget() {
    ParagraphSplitter::new(10, 10);
}
