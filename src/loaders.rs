//! The per-request loader catalog
//!
//! A [`RequestLoaders`] is created for every gateway request and dropped with
//! it, which discards the request's memo. Loaders of the same key-space share
//! one memo, so the manager chain reuses employees already loaded directly.

use crate::cache::SharedCacheStore;
use crate::client::ClientManager;
use crate::config::{CacheSettings, LoaderSettings};
use crate::dataloader::{EntityLoader, KeySpace, LoaderOptions};
use crate::observability::SharedCacheEventSink;
use crate::relationships::{ChainedLoader, OneToManyLoader, RelationSpec};

/// One entity key-space and the entity type mutations use to invalidate it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub entity_type: &'static str,
    pub service: &'static str,
    pub keyspace: &'static str,
}

const fn entry(
    entity_type: &'static str,
    service: &'static str,
    keyspace: &'static str,
) -> CatalogEntry {
    CatalogEntry {
        entity_type,
        service,
        keyspace,
    }
}

/// Entity key-spaces, each served by `Get{Keyspace}ByIds`
pub const ENTITY_CATALOG: &[CatalogEntry] = &[
    entry("user", "auth", "users"),
    entry("userProfile", "auth", "userProfiles"),
    entry("userPermission", "auth", "userPermissions"),
    entry("contact", "crm", "contacts"),
    entry("lead", "crm", "leads"),
    entry("opportunity", "crm", "opportunities"),
    entry("activity", "crm", "activities"),
    entry("employee", "hrm", "employees"),
    entry("department", "hrm", "departments"),
    entry("leave", "hrm", "leaves"),
    entry("timesheet", "hrm", "timesheets"),
    entry("invoice", "finance", "invoices"),
    entry("payment", "finance", "payments"),
    entry("invoiceLineItem", "finance", "invoiceLineItems"),
    entry("product", "inventory", "products"),
    entry("category", "inventory", "categories"),
    entry("supplier", "inventory", "suppliers"),
    entry("stockMovement", "inventory", "stockMovements"),
];

/// Relation key-spaces, listed under the entity type of the parent
pub const RELATION_CATALOG: &[CatalogEntry] = &[
    entry("contact", "crm", "contactLeads"),
    entry("invoice", "finance", "invoiceLineItemsByInvoice"),
    entry("product", "inventory", "productStockMovements"),
];

fn contact_leads_spec() -> RelationSpec {
    RelationSpec::new("crm", "contactLeads", "GetLeadsByContactIds")
        .request_field("contactIds")
        .response_field("leads")
        .group_by("contactId")
}

fn invoice_line_items_spec() -> RelationSpec {
    RelationSpec::new(
        "finance",
        "invoiceLineItemsByInvoice",
        "GetInvoiceLineItemsByInvoiceIds",
    )
    .request_field("invoiceIds")
    .response_field("lineItems")
    .group_by("invoiceId")
}

fn product_stock_movements_spec() -> RelationSpec {
    RelationSpec::new(
        "inventory",
        "productStockMovements",
        "GetStockMovementsByProductIds",
    )
    .request_field("productIds")
    .response_field("movements")
    .group_by("productId")
    .with_param("limit", serde_json::json!(10))
}

/// Every loader available to one gateway request
#[derive(Clone, Debug)]
pub struct RequestLoaders {
    users: EntityLoader,
    user_profiles: EntityLoader,
    user_permissions: EntityLoader,
    contacts: EntityLoader,
    leads: EntityLoader,
    opportunities: EntityLoader,
    activities: EntityLoader,
    employees: EntityLoader,
    departments: EntityLoader,
    leaves: EntityLoader,
    timesheets: EntityLoader,
    invoices: EntityLoader,
    payments: EntityLoader,
    invoice_line_items_by_id: EntityLoader,
    products: EntityLoader,
    categories: EntityLoader,
    suppliers: EntityLoader,
    stock_movements: EntityLoader,

    contact_leads: OneToManyLoader,
    invoice_line_items: OneToManyLoader,
    product_stock_movements: OneToManyLoader,
    employee_manager: ChainedLoader,
}

impl RequestLoaders {
    pub fn new(
        clients: &ClientManager,
        store: SharedCacheStore,
        sink: SharedCacheEventSink,
        loader: &LoaderSettings,
        cache: &CacheSettings,
    ) -> Self {
        let options = LoaderOptions::from_settings(loader, cache);
        let relation_options = options.with_max_batch_size(loader.relationship_batch_size);

        let entity = |service: &str, keyspace: &str| {
            EntityLoader::new(
                KeySpace::entity(service, keyspace),
                clients.client(service),
                store.clone(),
                sink.clone(),
                options,
            )
        };
        let relation = |spec: RelationSpec| {
            let client = clients.client(&spec.service);
            OneToManyLoader::new(spec, client, store.clone(), sink.clone(), relation_options)
        };

        let employees = entity("hrm", "employees");
        let employee_manager = ChainedLoader::new(employees.clone(), "managerId");

        Self {
            users: entity("auth", "users"),
            user_profiles: entity("auth", "userProfiles"),
            user_permissions: entity("auth", "userPermissions"),
            contacts: entity("crm", "contacts"),
            leads: entity("crm", "leads"),
            opportunities: entity("crm", "opportunities"),
            activities: entity("crm", "activities"),
            employees,
            departments: entity("hrm", "departments"),
            leaves: entity("hrm", "leaves"),
            timesheets: entity("hrm", "timesheets"),
            invoices: entity("finance", "invoices"),
            payments: entity("finance", "payments"),
            invoice_line_items_by_id: entity("finance", "invoiceLineItems"),
            products: entity("inventory", "products"),
            categories: entity("inventory", "categories"),
            suppliers: entity("inventory", "suppliers"),
            stock_movements: entity("inventory", "stockMovements"),

            contact_leads: relation(contact_leads_spec()),
            invoice_line_items: relation(invoice_line_items_spec()),
            product_stock_movements: relation(product_stock_movements_spec()),
            employee_manager,
        }
    }

    pub fn users(&self) -> &EntityLoader {
        &self.users
    }

    pub fn user_profiles(&self) -> &EntityLoader {
        &self.user_profiles
    }

    pub fn user_permissions(&self) -> &EntityLoader {
        &self.user_permissions
    }

    pub fn contacts(&self) -> &EntityLoader {
        &self.contacts
    }

    pub fn leads(&self) -> &EntityLoader {
        &self.leads
    }

    pub fn opportunities(&self) -> &EntityLoader {
        &self.opportunities
    }

    pub fn activities(&self) -> &EntityLoader {
        &self.activities
    }

    pub fn employees(&self) -> &EntityLoader {
        &self.employees
    }

    pub fn departments(&self) -> &EntityLoader {
        &self.departments
    }

    pub fn leaves(&self) -> &EntityLoader {
        &self.leaves
    }

    pub fn timesheets(&self) -> &EntityLoader {
        &self.timesheets
    }

    pub fn invoices(&self) -> &EntityLoader {
        &self.invoices
    }

    pub fn payments(&self) -> &EntityLoader {
        &self.payments
    }

    /// Line items by their own id
    pub fn invoice_line_items_by_id(&self) -> &EntityLoader {
        &self.invoice_line_items_by_id
    }

    pub fn products(&self) -> &EntityLoader {
        &self.products
    }

    pub fn categories(&self) -> &EntityLoader {
        &self.categories
    }

    pub fn suppliers(&self) -> &EntityLoader {
        &self.suppliers
    }

    pub fn stock_movements(&self) -> &EntityLoader {
        &self.stock_movements
    }

    /// Leads by contact id
    pub fn contact_leads(&self) -> &OneToManyLoader {
        &self.contact_leads
    }

    /// Line items by invoice id
    pub fn invoice_line_items(&self) -> &OneToManyLoader {
        &self.invoice_line_items
    }

    /// Latest ten stock movements by product id
    pub fn product_stock_movements(&self) -> &OneToManyLoader {
        &self.product_stock_movements
    }

    /// An employee's manager, by employee id
    pub fn employee_manager(&self) -> &ChainedLoader {
        &self.employee_manager
    }

    /// Entity loader by key-space name (`contacts`, `stockMovements`, ...)
    pub fn entity(&self, keyspace: &str) -> Option<&EntityLoader> {
        let loader = match keyspace {
            "users" => &self.users,
            "userProfiles" => &self.user_profiles,
            "userPermissions" => &self.user_permissions,
            "contacts" => &self.contacts,
            "leads" => &self.leads,
            "opportunities" => &self.opportunities,
            "activities" => &self.activities,
            "employees" => &self.employees,
            "departments" => &self.departments,
            "leaves" => &self.leaves,
            "timesheets" => &self.timesheets,
            "invoices" => &self.invoices,
            "payments" => &self.payments,
            "invoiceLineItems" => &self.invoice_line_items_by_id,
            "products" => &self.products,
            "categories" => &self.categories,
            "suppliers" => &self.suppliers,
            "stockMovements" => &self.stock_movements,
            _ => return None,
        };
        Some(loader)
    }

    /// Relation loader by key-space name (`contactLeads`, ...)
    pub fn relation(&self, keyspace: &str) -> Option<&OneToManyLoader> {
        [
            &self.contact_leads,
            &self.invoice_line_items,
            &self.product_stock_movements,
        ]
        .into_iter()
        .find(|loader| loader.spec().name == keyspace)
    }

    /// Seed a known value into the named loader and the shared cache.
    ///
    /// Relation loaders take a JSON array of children. Returns `false` when
    /// no loader has that name or the value does not fit it.
    pub fn prime_cache(
        &self,
        keyspace: &str,
        id: impl Into<String>,
        value: serde_json::Value,
    ) -> bool {
        if let Some(loader) = self.entity(keyspace) {
            loader.prime(id, value);
            return true;
        }
        match (self.relation(keyspace), value) {
            (Some(loader), serde_json::Value::Array(children)) => {
                loader.prime(id, children);
                true
            }
            _ => false,
        }
    }
}
