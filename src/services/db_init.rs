use mongodb::{
    bson::doc,
    Database, IndexModel,
};

pub async fn ensure_indexes(db: &Database) -> Result<(), String> {
    let col = db.collection::<mongodb::bson::Document>("orders");

    // orders: list by owner, newest first
    {
        let model = IndexModel::builder()
            .keys(doc! { "user_id": 1, "_id": -1 })
            .build();

        col.create_index(model, None)
            .await
            .map_err(|e| e.to_string())?;
    }

    // orders: lookups by product
    {
        let model = IndexModel::builder()
            .keys(doc! { "product_id": 1 })
            .build();

        col.create_index(model, None)
            .await
            .map_err(|e| e.to_string())?;
    }

    // orders: filter by status
    {
        let model = IndexModel::builder()
            .keys(doc! { "status": 1 })
            .build();

        col.create_index(model, None)
            .await
            .map_err(|e| e.to_string())?;
    }

    Ok(())
}
