#[allow(warnings, clippy::all)]
pub(crate) mod item {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "items")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        #[sea_orm(unique)]
        pub short_code: String,
        pub content_type: String,
        #[sea_orm(column_type = "Text", nullable)]
        pub original_content: Option<String>,
        pub file_path: Option<String>,
        pub original_size_kb: i64,
        pub compressed_size_kb: i64,
        pub created_at: TimeDateTimeWithTimeZone,
        pub expires_at: Option<TimeDateTimeWithTimeZone>,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
