//! The viewer page, compiled into the binary.

use std::path::Path;

use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};

use super::files::content_type;
use super::{finish, status};

#[derive(Copy, Clone, Debug)]
pub struct Asset {
    pub path: &'static str,
    pub content: &'static [u8],
}

pub const ASSETS: &[Asset] = &[
    Asset {
        path: "/index.html",
        content: include_bytes!("../../static/index.html"),
    },
    Asset {
        path: "/player.js",
        content: include_bytes!("../../static/player.js"),
    },
    Asset {
        path: "/style.css",
        content: include_bytes!("../../static/style.css"),
    },
];

/// Returns the asset for the url `path`. Directory paths resolve to their `index.html`.
pub fn find(path: &str) -> Option<&'static Asset> {
    let index;
    let path = if path.ends_with('/') {
        index = format!("{}index.html", path);
        index.as_str()
    } else {
        path
    };

    ASSETS.iter().find(|asset| asset.path == path)
}

pub fn serve(path: &str) -> Response<Body> {
    match find(path) {
        Some(asset) => finish(
            Response::builder()
                .header(CONTENT_TYPE, content_type(Path::new(asset.path)))
                .header(CONTENT_LENGTH, asset.content.len()),
            Body::from(asset.content),
        ),
        None => status(StatusCode::NOT_FOUND),
    }
}
