pub mod converter;
pub mod describer;
pub mod downloader;
pub mod report;
pub mod video;

pub use converter::{ConvertOptions, ConvertReport, ImageConverter};
pub use describer::{BatchOutcome, DescribeJob, WorkerPool};
pub use downloader::{
    extract_image_urls, DownloadCandidate, DownloadOptions, DownloadReport, Downloader, HttpFetcher,
    ReqwestFetcher,
};
pub use report::{DescriptionsDocument, HtmlReport, ReportEntry};
pub use video::{FrameExtractor, VideoReport};
