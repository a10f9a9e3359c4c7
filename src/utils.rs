use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

/// Progress bar shown on the span of a whole build.
pub(crate) fn get_style_build() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Spinner shown on the span of a single request.
pub(crate) fn get_style_request() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}
