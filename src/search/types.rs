use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    #[default]
    Basic,
    Advanced,
}

impl SearchDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchDepth::Basic => "basic",
            SearchDepth::Advanced => "advanced",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub include_images: bool,
    pub depth: SearchDepth,
    pub max_results: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchHit>,
    #[serde(default)]
    pub images: Vec<SearchImage>,
}

/// Wire shapes of the Tavily-style API.
pub(super) mod wire {
    use serde::{Deserialize, Serialize};

    use super::{SearchHit, SearchImage, SearchResponse};

    #[derive(Debug, Serialize)]
    pub struct Request<'a> {
        pub query: &'a str,
        pub search_depth: &'static str,
        pub include_images: bool,
        pub include_image_descriptions: bool,
        pub max_results: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Response {
        #[serde(default)]
        pub results: Vec<Hit>,
        #[serde(default)]
        pub images: Vec<Image>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Hit {
        pub title: Option<String>,
        pub url: Option<String>,
        pub content: Option<String>,
        pub author: Option<String>,
        pub published_date: Option<String>,
    }

    /// Images come back as bare URLs, or as objects once descriptions are on.
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum Image {
        Url(String),
        Described {
            url: String,
            description: Option<String>,
        },
    }

    impl From<Response> for SearchResponse {
        fn from(r: Response) -> Self {
            SearchResponse {
                results: r
                    .results
                    .into_iter()
                    .filter_map(|h| {
                        let url = h.url.filter(|u| !u.is_empty())?;
                        Some(SearchHit {
                            title: h.title.unwrap_or_default(),
                            url,
                            content: h.content.unwrap_or_default(),
                            author: h.author.filter(|a| !a.is_empty()),
                            published_date: h.published_date.filter(|d| !d.is_empty()),
                        })
                    })
                    .collect(),
                images: r
                    .images
                    .into_iter()
                    .map(|i| match i {
                        Image::Url(url) => SearchImage { url, alt_text: None },
                        Image::Described { url, description } => SearchImage {
                            url,
                            alt_text: description,
                        },
                    })
                    .collect(),
            }
        }
    }
}
