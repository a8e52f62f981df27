//! Tests for utility functions

use render_farm::util::{elapsed_ms, FrameRange, Priority, RendererKind};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

#[test]
fn test_priority_parse() {
    assert_eq!(" Critical ".parse::<Priority>().unwrap(), Priority::Critical);
    assert!("urgent".parse::<Priority>().is_err());
}

#[test]
fn test_renderer_serde_names() {
    let json = serde_json::to_string(&RendererKind::Silhouette).unwrap();
    assert_eq!(json, "\"silhouette\"");
    let back: RendererKind = serde_json::from_str("\"fusion\"").unwrap();
    assert_eq!(back, RendererKind::Fusion);
}

#[test]
fn test_frame_range() {
    let range: FrameRange = "1001-1100".parse().unwrap();
    assert_eq!(range.len(), 100);
    assert_eq!(range.to_string(), "1001-1100");
    assert!(FrameRange::new(5, 4).is_err());
}

#[test]
fn test_elapsed() {
    assert_eq!(elapsed_ms(10, 25), 15);
    assert_eq!(elapsed_ms(25, 10), 0);
}
