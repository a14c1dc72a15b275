//! Useful macros.

/// Join an ordered list of path components into a `/`-separated path
/// string. Remote paths are plain strings throughout the crate, so this is
/// deliberately not `std::path` based.
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = String::from($first);

        $(
            path.push('/');
            path.push_str(String::from($part).as_str());
        )*

        path
    }}
}
