//! Field-level checks run before any store access.

use crate::error::ValidationError;
use crate::model::EntitySchema;
use crate::value::Value;

/// Check an entity's scalar values against its schema.
///
/// Reports every required field holding NULL and every value whose type the
/// column cannot store. Length bounds are left to the store.
pub fn validate_scalars(
    schema: &EntitySchema,
    scalars: &[(&'static str, Value)],
) -> Result<(), ValidationError> {
    let mut errors = ValidationError::new(schema.name);
    for field in schema.writable_fields() {
        let Some((_, value)) = scalars.iter().find(|(name, _)| *name == field.name) else {
            errors.add_custom(field.name, "is not exposed by the entity");
            continue;
        };
        if value.is_null() {
            if !field.nullable {
                errors.add_required(field.name);
            }
        } else if !field.sql_type.accepts(value) {
            errors.add_custom(
                field.name,
                format!(
                    "{} cannot be stored in a {} column",
                    value.type_name(),
                    field.sql_type.as_sql()
                ),
            );
        }
    }
    errors.into_result()
}
