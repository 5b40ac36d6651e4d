//! GraphQL documents sent to AniList.

macro_rules! media_fields {
    () => {
        "id
        title { romaji english native }
        synonyms
        episodes
        description(asHtml: false)
        genres
        season
        seasonYear
        averageScore
        status
        coverImage { large }"
    };
}

macro_rules! list_entry_fields {
    () => {
        "id
        mediaId
        status
        progress
        score(format: POINT_100)
        startedAt { year month day }
        completedAt { year month day }
        updatedAt"
    };
}

pub const VIEWER: &str = "query { Viewer { id name } }";

pub const LIBRARY: &str = concat!(
    "query ($userId: Int) {
    MediaListCollection(userId: $userId, type: ANIME) {
        lists { entries { ",
    list_entry_fields!(),
    " } }
    }
}"
);

pub const MEDIA: &str = concat!(
    "query ($id: Int) { Media(id: $id, type: ANIME) { ",
    media_fields!(),
    " } }"
);

pub const SEARCH: &str = concat!(
    "query ($search: String) {
    Page(perPage: 10) {
        pageInfo { hasNextPage }
        media(search: $search, type: ANIME) { ",
    media_fields!(),
    " }
    }
}"
);

pub const SEASON: &str = concat!(
    "query ($season: MediaSeason, $seasonYear: Int, $page: Int) {
    Page(page: $page, perPage: 50) {
        pageInfo { hasNextPage }
        media(season: $season, seasonYear: $seasonYear, type: ANIME, sort: POPULARITY_DESC) { ",
    media_fields!(),
    " }
    }
}"
);

pub const SAVE_ENTRY: &str = concat!(
    "mutation ($mediaId: Int, $status: MediaListStatus, $progress: Int, $scoreRaw: Int,
          $startedAt: FuzzyDateInput, $completedAt: FuzzyDateInput) {
    SaveMediaListEntry(mediaId: $mediaId, status: $status, progress: $progress, scoreRaw: $scoreRaw,
                       startedAt: $startedAt, completedAt: $completedAt) { ",
    list_entry_fields!(),
    " }
}"
);

pub const FIND_ENTRY: &str = "query ($mediaId: Int, $userId: Int) {
    MediaList(mediaId: $mediaId, userId: $userId, type: ANIME) { id }
}";

pub const DELETE_ENTRY: &str = "mutation ($id: Int) { DeleteMediaListEntry(id: $id) { deleted } }";
