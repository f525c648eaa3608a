pub mod jsonl_source;

pub use jsonl_source::JsonlExportSource;
