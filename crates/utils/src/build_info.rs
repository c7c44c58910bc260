/// Git metadata captured by the build script. Fields are empty when the
/// crate is built outside a git checkout.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub branch: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    branch: option_env!("VERGEN_GIT_BRANCH"),
    git_dirty: match option_env!("VERGEN_GIT_DIRTY") {
        Some(s) => matches!(s.as_bytes(), b"true"),
        None => false,
    },
};
