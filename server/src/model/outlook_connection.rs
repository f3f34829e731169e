use entity::outlook_connection;
use entity::prelude::*;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::error::AppResult;

pub struct OutlookConnectionCtrl;

impl OutlookConnectionCtrl {
    pub async fn get_by_user(
        conn: &DatabaseConnection,
        user_id: &str,
    ) -> AppResult<Option<outlook_connection::Model>> {
        let row = OutlookConnection::find()
            .filter(outlook_connection::Column::UserId.eq(user_id))
            .one(conn)
            .await?;

        Ok(row)
    }
}
