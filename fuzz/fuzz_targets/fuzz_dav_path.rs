//! Fuzz target for request path normalization
//!
//! Feeds arbitrary raw paths and mount prefixes through `DavPath::parse` and
//! `Mount::locate`, checking that accepted paths are normalized and can
//! never leave the mount.

#![no_main]

use arbitrary::Arbitrary;
use dav_engine::{DavPath, Mount};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    mount: &'a str,
    raw: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    if input.raw.len() > 4096 || input.mount.len() > 256 {
        return;
    }

    if let Ok(path) = DavPath::parse(input.raw) {
        // Normalized form has no empty, `.` or `..` segments
        for segment in path.components() {
            assert!(!segment.is_empty());
            assert_ne!(segment, ".");
            assert_ne!(segment, "..");
            assert!(!segment.contains('\\'));
            assert!(!segment.chars().any(char::is_control));
        }

        // Parsing the display form is a fixed point
        let reparsed = DavPath::parse(&path.to_string()).expect("normalized path must reparse");
        assert_eq!(reparsed, path);

        // Parent and join agree
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            assert!(parent.is_ancestor_of(&path));
            assert_eq!(parent.join(name), path);
        }
    }

    let Ok(mount) = Mount::new(input.mount) else {
        return;
    };
    if let Ok(located) = mount.locate(input.raw) {
        // Whatever was located sits under the mount prefix once re-rooted
        let full = DavPath::parse(input.raw).expect("locate only accepts parseable paths");
        assert!(mount.prefix().contains(&full));
        assert_eq!(
            located.rebase(&DavPath::root(), mount.prefix()).as_ref(),
            Some(&full)
        );
    }
});
